//! Configuration layer: typed settings with layered precedence (file → env).

use std::{num::NonZeroU32, path::Path, str::FromStr, time::Duration};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "studio-cache";
const ENV_PREFIX: &str = "STUDIO_CACHE";
const DEFAULT_REDIS_POOL_SIZE: u64 = 16;
const DEFAULT_REDIS_TIMEOUT_MS: u64 = 1_000;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub redis: RedisSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub prefix: String,
    pub lock_ttl: Duration,
    pub background_lock_ttl: Duration,
    pub lock_retry_delay: Duration,
    pub lock_retry_attempts: NonZeroU32,
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    /// `None` selects the in-process memory store.
    pub url: Option<String>,
    pub pool_size: NonZeroU32,
    /// Upper bound on waiting for, creating and recycling a pooled connection.
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (defaults file → local file →
/// explicit file → environment).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    redis: RawRedisSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            redis,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            redis: build_redis_settings(redis)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();
    let prefix = cache
        .prefix
        .map(|value| value.trim().to_string())
        .unwrap_or(defaults.prefix);
    if prefix
        .chars()
        .any(|ch| ch.is_whitespace() || matches!(ch, '*' | '?' | '[' | ']' | '\\'))
    {
        return Err(LoadError::invalid(
            "cache.prefix",
            "must not contain whitespace or glob metacharacters",
        ));
    }

    let lock_ttl = positive_seconds(
        cache.lock_ttl_seconds.unwrap_or(defaults.lock_ttl_seconds),
        "cache.lock_ttl_seconds",
    )?;
    let background_lock_ttl = positive_seconds(
        cache
            .background_lock_ttl_seconds
            .unwrap_or(defaults.background_lock_ttl_seconds),
        "cache.background_lock_ttl_seconds",
    )?;

    let retry_delay_ms = cache
        .lock_retry_delay_ms
        .unwrap_or(defaults.lock_retry_delay_ms);
    if retry_delay_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lock_retry_delay_ms",
            "must be greater than zero",
        ));
    }

    let lock_retry_attempts = non_zero_u32(
        cache
            .lock_retry_attempts
            .unwrap_or(u64::from(defaults.lock_retry_attempts)),
        "cache.lock_retry_attempts",
    )?;

    let jitter_ratio = cache.jitter_ratio.unwrap_or(defaults.jitter_ratio);
    if !(0.0..1.0).contains(&jitter_ratio) {
        return Err(LoadError::invalid(
            "cache.jitter_ratio",
            "must be at least 0 and below 1",
        ));
    }

    Ok(CacheSettings {
        prefix,
        lock_ttl,
        background_lock_ttl,
        lock_retry_delay: Duration::from_millis(retry_delay_ms),
        lock_retry_attempts,
        jitter_ratio,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = redis.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if url
        .as_deref()
        .is_some_and(|url| !(url.starts_with("redis://") || url.starts_with("rediss://")))
    {
        return Err(LoadError::invalid(
            "redis.url",
            "must use the redis:// or rediss:// scheme",
        ));
    }

    let pool_size = non_zero_u32(
        redis.pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE),
        "redis.pool_size",
    )?;

    let timeout_ms = redis.timeout_ms.unwrap_or(DEFAULT_REDIS_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "redis.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(RedisSettings {
        url,
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    prefix: Option<String>,
    lock_ttl_seconds: Option<u64>,
    background_lock_ttl_seconds: Option<u64>,
    lock_retry_delay_ms: Option<u64>,
    lock_retry_attempts: Option<u64>,
    jitter_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    pool_size: Option<u64>,
    timeout_ms: Option<u64>,
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
