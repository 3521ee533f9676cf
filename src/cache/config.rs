//! Cache engine configuration.
//!
//! Controls key prefixing, lock timing and TTL jitter. Built from the
//! validated `[cache]` settings section, or constructed directly.

use std::time::Duration;

// Defaults shared with the `[cache]` settings section.
const DEFAULT_PREFIX: &str = "studio";
const DEFAULT_LOCK_TTL_SECS: u64 = 10;
const DEFAULT_BACKGROUND_LOCK_TTL_SECS: u64 = 30;
const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 200;
const DEFAULT_LOCK_RETRY_ATTEMPTS: u32 = 50;
const DEFAULT_JITTER_RATIO: f64 = 0.15;

/// Cache engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace prepended to every physical key, `<prefix>:<key>`.
    pub prefix: String,
    /// TTL of the primary stampede lock.
    pub lock_ttl_seconds: u64,
    /// TTL of the background revalidation lock.
    pub background_lock_ttl_seconds: u64,
    /// Pause between attempts while another process fills a key.
    pub lock_retry_delay_ms: u64,
    /// Attempts before `wrap` gives up waiting on a held lock.
    pub lock_retry_attempts: u32,
    /// Relative TTL perturbation, 0.15 means ±15%.
    pub jitter_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            lock_ttl_seconds: DEFAULT_LOCK_TTL_SECS,
            background_lock_ttl_seconds: DEFAULT_BACKGROUND_LOCK_TTL_SECS,
            lock_retry_delay_ms: DEFAULT_LOCK_RETRY_DELAY_MS,
            lock_retry_attempts: DEFAULT_LOCK_RETRY_ATTEMPTS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            lock_ttl_seconds: settings.lock_ttl.as_secs(),
            background_lock_ttl_seconds: settings.background_lock_ttl.as_secs(),
            lock_retry_delay_ms: u64::try_from(settings.lock_retry_delay.as_millis())
                .unwrap_or(u64::MAX),
            lock_retry_attempts: settings.lock_retry_attempts.get(),
            jitter_ratio: settings.jitter_ratio,
        }
    }
}

impl CacheConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds.max(1))
    }

    pub fn background_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.background_lock_ttl_seconds.max(1))
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Attempt budget, at least one.
    pub fn lock_retry_attempts(&self) -> u32 {
        self.lock_retry_attempts.max(1)
    }

    /// Physical key for a logical key or pattern.
    pub fn physical_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }
}
