//! KV store adapter.
//!
//! [`KvStore`] is the narrow surface the engine needs from the shared store:
//! plain get/set with TTL, set-if-absent, single and batch delete, and
//! pattern enumeration. [`MemoryStore`] keeps everything in-process and is
//! what single-node deployments and tests run against; the Redis backend
//! lives in `infra::redis`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::clock::{Clock, SystemClock};
use super::lock::{rw_read, rw_write};

/// Errors surfaced by a KV backend.
#[derive(Debug, Error)]
pub enum KvError {
    /// The backend could not be reached (connection, pool, timeout).
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but rejected or failed the command.
    #[error("kv command failed: {0}")]
    Command(String),
}

impl KvError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }
}

/// A shared, network-accessible key-value store.
///
/// Keys passed in are physical keys; prefixing is the caller's job. Values are
/// opaque text.
#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// Backend label for logs and metrics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Write `value` with a physical time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Write `value` only if `key` does not exist. Returns whether it was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Delete `key` only while it still holds `value`, atomically. Returns
    /// whether it was removed. Locks are released through this so a holder
    /// whose lock expired cannot drop a lock another caller now owns.
    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, KvError>;

    /// Delete all `keys` in one batch. Returns how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize, KvError>;

    /// Enumerate keys matching a glob `pattern` (`*`, `?`, `[...]`, `\` escapes).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError>;

    async fn delete_by_pattern(&self, pattern: &str) -> Result<usize, KvError> {
        let keys = self.scan(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        self.delete_many(&keys).await
    }

    /// Release backend resources.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: i64,
}

impl StoredValue {
    fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Writes between full sweeps of expired entries.
const SWEEP_EVERY: u64 = 1_024;

/// In-process [`KvStore`] with absolute per-key expiry.
///
/// Keys are kept ordered so pattern scans only walk the range sharing the
/// pattern's literal prefix. Expired entries are invisible. They are dropped
/// when read or scanned, and every [`SWEEP_EVERY`] writes a full sweep removes
/// the ones nothing touched again.
#[derive(Debug)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, StoredValue>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = rw_write(&self.entries, "purge_expired");
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        before - entries.len()
    }

    /// Remaining physical TTL of a live key, like Redis `PTTL`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        let entries = rw_read(&self.entries, "ttl");
        let stored = entries.get(key).filter(|stored| stored.is_live(now))?;
        let remaining = u64::try_from(stored.expires_at_ms - now).unwrap_or(0);
        Some(Duration::from_millis(remaining))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        rw_read(&self.entries, "len")
            .values()
            .filter(|stored| stored.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deadline(&self, now_ms: i64, ttl: Duration) -> i64 {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(ttl_ms.max(1))
    }

    /// Count a write and sweep once enough have accumulated.
    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            self.purge_expired();
        }
    }

    /// Entries held in memory, expired ones included.
    #[cfg(test)]
    fn physical_len(&self) -> usize {
        rw_read(&self.entries, "physical_len").len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let now = self.clock.now_millis();
        {
            let entries = rw_read(&self.entries, "get");
            match entries.get(key) {
                None => return Ok(None),
                Some(stored) if stored.is_live(now) => return Ok(Some(stored.value.clone())),
                Some(_) => {}
            }
        }

        let mut entries = rw_write(&self.entries, "get.purge");
        if entries.get(key).is_some_and(|stored| !stored.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let now = self.clock.now_millis();
        let stored = StoredValue {
            value: value.to_string(),
            expires_at_ms: self.deadline(now, ttl),
        };
        rw_write(&self.entries, "set").insert(key.to_string(), stored);
        self.note_write();
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = self.clock.now_millis();
        let mut entries = rw_write(&self.entries, "set_nx");
        if entries.get(key).is_some_and(|stored| stored.is_live(now)) {
            return Ok(false);
        }
        let stored = StoredValue {
            value: value.to_string(),
            expires_at_ms: self.deadline(now, ttl),
        };
        entries.insert(key.to_string(), stored);
        drop(entries);
        self.note_write();
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let now = self.clock.now_millis();
        let removed = rw_write(&self.entries, "delete").remove(key);
        Ok(removed.is_some_and(|stored| stored.is_live(now)))
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let now = self.clock.now_millis();
        let mut entries = rw_write(&self.entries, "delete_if_value");
        let owned = entries
            .get(key)
            .is_some_and(|stored| stored.is_live(now) && stored.value == value);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, KvError> {
        let now = self.clock.now_millis();
        let mut entries = rw_write(&self.entries, "delete_many");
        let removed = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .filter(|stored| stored.is_live(now))
            .count();
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let now = self.clock.now_millis();
        let prefix = literal_prefix(pattern);
        let mut keys = Vec::new();
        let mut expired = Vec::new();
        {
            let entries = rw_read(&self.entries, "scan");
            let in_range = entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix));
            for (key, stored) in in_range {
                if !stored.is_live(now) {
                    expired.push(key.clone());
                } else if glob_match(pattern, key) {
                    keys.push(key.clone());
                }
            }
        }

        if !expired.is_empty() {
            let mut entries = rw_write(&self.entries, "scan.purge");
            for key in &expired {
                if entries.get(key).is_some_and(|stored| !stored.is_live(now)) {
                    entries.remove(key);
                }
            }
        }
        Ok(keys)
    }
}

/// The part of a glob pattern before its first metacharacter.
fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(['*', '?', '[', '\\'])
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Redis-style glob matching: `*`, `?`, `[abc]`, `[a-z]`, `[^x]`, `\` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    // (pattern index after the last `*`, text index that `*` currently absorbs up to)
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < text.len() {
        if pattern.get(pi) == Some(&'*') {
            pi += 1;
            backtrack = Some((pi, ti));
        } else if let Some(next) = match_token(&pattern, pi, text[ti]) {
            pi = next;
            ti += 1;
        } else if let Some((after_star, absorbed)) = backtrack {
            pi = after_star;
            ti = absorbed + 1;
            backtrack = Some((after_star, absorbed + 1));
        } else {
            return false;
        }
    }

    pattern[pi..].iter().all(|&c| c == '*')
}

/// Match one non-`*` token at `pi` against `c`, returning the next pattern index.
fn match_token(pattern: &[char], pi: usize, c: char) -> Option<usize> {
    match *pattern.get(pi)? {
        '*' => None,
        '?' => Some(pi + 1),
        '\\' => match pattern.get(pi + 1) {
            Some(&escaped) => (escaped == c).then_some(pi + 2),
            None => (c == '\\').then_some(pi + 1),
        },
        '[' if class_end(pattern, pi).is_some() => match_class(pattern, pi, c),
        literal => (literal == c).then_some(pi + 1),
    }
}

fn class_end(pattern: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if pattern.get(i) == Some(&'^') {
        i += 1;
    }
    // A `]` right after the opening bracket is a literal member.
    if pattern.get(i) == Some(&']') {
        i += 1;
    }
    while let Some(&ch) = pattern.get(i) {
        match ch {
            ']' => return Some(i),
            '\\' => i += 2,
            _ => i += 1,
        }
    }
    None
}

fn match_class(pattern: &[char], start: usize, c: char) -> Option<usize> {
    let end = class_end(pattern, start)?;
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < end {
        let ch = pattern[i];
        if ch == '\\' && i + 1 < end {
            matched |= pattern[i + 1] == c;
            i += 2;
        } else if i + 2 < end && pattern[i + 1] == '-' {
            let (lo, hi) = (ch.min(pattern[i + 2]), ch.max(pattern[i + 2]));
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= ch == c;
            i += 1;
        }
    }

    (matched != negate).then_some(end + 1)
}
