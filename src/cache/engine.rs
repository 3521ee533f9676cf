//! Cache-aside engine.
//!
//! [`Cache::wrap`] serves a key from the shared store when it is fresh, serves
//! it stale while one background task refreshes it when it is inside the
//! stale-while-revalidate window, and otherwise recomputes it under an NX lock
//! so only one caller across all processes runs the producer. Everything else
//! on [`Cache`] is the direct invalidation API.
//!
//! The store is best-effort: a failed read is a miss, a failed write is
//! logged and dropped. Only producer errors and lock timeouts reach callers.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::envelope;
use super::jitter::{jitter_ttl, jitter_ttl_upward};
use super::keys::{background_lock_key, lock_key};
use super::store::{KvError, KvStore};

/// What is stored under a key filled by [`Cache::wrap`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub data: T,
    /// Logical expiry in Unix epoch milliseconds.
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms <= self.expires_at
    }

    /// Past expiry but still inside `window` after it.
    pub fn is_servable_stale(&self, now_ms: i64, window: Duration) -> bool {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        now_ms > self.expires_at && now_ms <= self.expires_at.saturating_add(window_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WrapOptions {
    /// Grace window after expiry during which the old value is served while
    /// a background task refreshes it. `None` disables stale serving.
    pub stale_while_revalidate: Option<Duration>,
}

impl WrapOptions {
    pub fn stale_while_revalidate(window: Duration) -> Self {
        Self {
            stale_while_revalidate: Some(window),
        }
    }

    fn grace(&self) -> Duration {
        self.stale_while_revalidate.unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Error)]
pub enum WrapError<E> {
    /// The producer failed on the synchronous fill path.
    #[error("producer failed: {0}")]
    Producer(E),
    /// Another caller held the fill lock for the whole retry budget.
    #[error("gave up waiting for fill lock on `{key}` after {attempts} attempts")]
    LockTimeout { key: String, attempts: u32 },
}

impl<E> WrapError<E> {
    pub fn into_producer(self) -> Option<E> {
        match self {
            Self::Producer(err) => Some(err),
            Self::LockTimeout { .. } => None,
        }
    }

    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

/// Cache handle. Cheap to clone; clones share the store and the set of
/// in-flight background revalidations.
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    config: Arc<CacheConfig>,
    clock: Arc<dyn Clock>,
    revalidations: TaskTracker,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("store", &self.store.name())
            .field("prefix", &self.config.prefix)
            .field("pending_revalidations", &self.revalidations.len())
            .finish()
    }
}

enum Lookup<T> {
    Fresh(T),
    Stale(T),
    Miss,
}

enum Step<T> {
    Hit(T),
    ServeStale(T),
    /// Run the producer; `lock` is the lock to release, if held.
    Fill { lock: Option<HeldLock> },
    TimedOut,
}

/// A lock this caller acquired: its physical key and the token written there.
struct HeldLock {
    key: String,
    token: String,
}

impl HeldLock {
    fn acquired(key: &str, token: String) -> Self {
        Self {
            key: key.to_string(),
            token,
        }
    }
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KvStore>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock,
            revalidations: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Read-through lookup of `key`, filling it from `producer` on a miss.
    ///
    /// `ttl` is the logical freshness window. The physical TTL written to the
    /// store is `ttl` plus the stale-while-revalidate window, jittered upward.
    pub async fn wrap<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
        options: WrapOptions,
    ) -> Result<T, WrapError<E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let physical = self.config.physical_key(key);
        let lock = self.config.physical_key(&lock_key(key));
        let attempts = self.config.lock_retry_attempts();

        let mut attempt = 0u32;
        let step = loop {
            attempt += 1;

            match self.lookup::<T>(&physical, options).await {
                Lookup::Fresh(data) => break Step::Hit(data),
                Lookup::Stale(data) => break Step::ServeStale(data),
                Lookup::Miss => {}
            }

            let token = Uuid::new_v4().to_string();
            match self.store.set_nx(&lock, &token, self.config.lock_ttl()).await {
                Ok(true) => {
                    let held = HeldLock::acquired(&lock, token);
                    // The previous holder may have filled the key between our
                    // read and the acquire.
                    if let Lookup::Fresh(data) = self.lookup::<T>(&physical, options).await {
                        self.release(&held).await;
                        break Step::Hit(data);
                    }
                    break Step::Fill { lock: Some(held) };
                }
                Ok(false) => {
                    counter!("studio_cache_lock_contention_total").increment(1);
                    if attempt >= attempts {
                        break Step::TimedOut;
                    }
                    debug!(key, attempt, op = "wrap", result = "lock_held", "waiting for fill");
                    tokio::time::sleep(self.config.lock_retry_delay()).await;
                }
                Err(err) => {
                    self.backend_failed("set_nx", &lock, &err);
                    break Step::Fill { lock: None };
                }
            }
        };

        match step {
            Step::Hit(data) => {
                counter!("studio_cache_lookup_total", "outcome" => "hit").increment(1);
                debug!(key, op = "wrap", result = "hit");
                Ok(data)
            }
            Step::ServeStale(data) => {
                counter!("studio_cache_lookup_total", "outcome" => "stale").increment(1);
                debug!(key, op = "wrap", result = "stale");
                self.schedule_revalidation(key, producer, ttl, options);
                Ok(data)
            }
            Step::Fill { lock } => {
                counter!("studio_cache_lookup_total", "outcome" => "miss").increment(1);
                debug!(key, op = "wrap", result = "miss", locked = lock.is_some());
                self.fill(key, &physical, lock, producer, ttl, options).await
            }
            Step::TimedOut => {
                counter!("studio_cache_lookup_total", "outcome" => "miss").increment(1);
                warn!(
                    key,
                    attempts,
                    op = "wrap",
                    result = "lock_timeout",
                    hint = "fill lock held for the whole retry budget",
                    "giving up on cache fill"
                );
                Err(WrapError::LockTimeout {
                    key: key.to_string(),
                    attempts,
                })
            }
        }
    }

    /// Decoded value stored under `key`, or `None` on absence or any failure.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let physical = self.config.physical_key(key);
        let raw = match self.store.get(&physical).await {
            Ok(raw) => raw?,
            Err(err) => {
                self.backend_failed("get", &physical, &err);
                return None;
            }
        };
        match envelope::decode(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    key = %physical,
                    op = "get",
                    error = %err,
                    "discarding undecodable cache value"
                );
                None
            }
        }
    }

    /// Encode and write `value` with a jittered `ttl`. Failures are logged.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let physical = self.config.physical_key(key);
        let raw = match envelope::encode(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %physical, op = "set", error = %err, "value not cacheable");
                return;
            }
        };
        let ttl = jitter_ttl(ttl, self.config.jitter_ratio);
        if let Err(err) = self.store.set(&physical, &raw, ttl).await {
            self.backend_failed("set", &physical, &err);
        }
    }

    /// Best-effort delete of one key.
    pub async fn del(&self, key: &str) {
        let physical = self.config.physical_key(key);
        match self.store.delete(&physical).await {
            Ok(removed) => debug!(key = %physical, op = "del", removed),
            Err(err) => self.backend_failed("del", &physical, &err),
        }
    }

    /// Delete every key matching the glob `pattern`. Returns how many were
    /// removed, zero when the store failed.
    pub async fn del_by_pattern(&self, pattern: &str) -> usize {
        let physical = self.config.physical_key(pattern);
        match self.store.delete_by_pattern(&physical).await {
            Ok(removed) => {
                counter!("studio_cache_invalidated_keys_total").increment(removed as u64);
                info!(
                    pattern = %physical,
                    op = "del_by_pattern",
                    removed,
                    "cache keys invalidated"
                );
                removed
            }
            Err(err) => {
                self.backend_failed("del_by_pattern", &physical, &err);
                0
            }
        }
    }

    /// Background revalidations still running.
    pub fn pending_revalidations(&self) -> usize {
        self.revalidations.len()
    }

    /// Stop scheduling revalidations, wait for running ones, then release the
    /// store. Every clone of this handle is affected.
    pub async fn shutdown(&self) {
        self.revalidations.close();
        let pending = self.revalidations.len();
        if pending > 0 {
            info!(pending, op = "shutdown", "waiting for background revalidations");
        }
        self.revalidations.wait().await;
        self.store.shutdown().await;
        info!(store = self.store.name(), op = "shutdown", "cache shut down");
    }

    async fn lookup<T: DeserializeOwned>(&self, physical: &str, options: WrapOptions) -> Lookup<T> {
        let raw = match self.store.get(physical).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(err) => {
                self.backend_failed("get", physical, &err);
                return Lookup::Miss;
            }
        };

        let entry: CacheEntry<T> = match envelope::decode(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    key = physical,
                    op = "get",
                    error = %err,
                    "treating undecodable entry as miss"
                );
                return Lookup::Miss;
            }
        };

        let now = self.clock.now_millis();
        if entry.is_fresh(now) {
            return Lookup::Fresh(entry.data);
        }
        match options.stale_while_revalidate {
            Some(window) if entry.is_servable_stale(now, window) => Lookup::Stale(entry.data),
            _ => Lookup::Miss,
        }
    }

    async fn fill<T, E, F, Fut>(
        &self,
        key: &str,
        physical: &str,
        lock: Option<HeldLock>,
        producer: F,
        ttl: Duration,
        options: WrapOptions,
    ) -> Result<T, WrapError<E>>
    where
        T: Serialize,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { producer().await })
            .catch_unwind()
            .await;
        histogram!("studio_cache_produce_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                if let Some(lock) = &lock {
                    self.release(lock).await;
                }
                std::panic::resume_unwind(panic);
            }
        };

        let result = match outcome {
            Ok(data) => {
                let raw = self.encode_entry(physical, &data, ttl);
                if let Some(raw) = raw {
                    self.write_entry(physical, raw, ttl, options).await;
                }
                Ok(data)
            }
            Err(err) => {
                debug!(key, op = "wrap", result = "producer_error", error = %err);
                Err(WrapError::Producer(err))
            }
        };

        if let Some(lock) = &lock {
            self.release(lock).await;
        }
        result
    }

    fn schedule_revalidation<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
        options: WrapOptions,
    ) where
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.revalidations.is_closed() {
            counter!("studio_cache_revalidate_total", "result" => "skipped").increment(1);
            debug!(key, op = "revalidate", result = "shutting_down");
            return;
        }

        let cache = self.clone();
        let key = key.to_string();
        gauge!("studio_cache_revalidations_in_flight").increment(1.0);
        self.revalidations.spawn(async move {
            cache.revalidate(&key, producer, ttl, options).await;
            gauge!("studio_cache_revalidations_in_flight").decrement(1.0);
        });
    }

    async fn revalidate<T, E, F, Fut>(
        &self,
        key: &str,
        producer: F,
        ttl: Duration,
        options: WrapOptions,
    ) where
        T: Serialize,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lock = self.config.physical_key(&background_lock_key(key));
        let token = Uuid::new_v4().to_string();
        match self
            .store
            .set_nx(&lock, &token, self.config.background_lock_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                counter!("studio_cache_revalidate_total", "result" => "skipped").increment(1);
                debug!(key, op = "revalidate", result = "already_running");
                return;
            }
            Err(err) => {
                self.backend_failed("set_nx", &lock, &err);
                counter!("studio_cache_revalidate_total", "result" => "error").increment(1);
                return;
            }
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { producer().await })
            .catch_unwind()
            .await;
        histogram!("studio_cache_produce_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(Ok(data)) => {
                let physical = self.config.physical_key(key);
                let raw = self.encode_entry(&physical, &data, ttl);
                if let Some(raw) = raw {
                    self.write_entry(&physical, raw, ttl, options).await;
                }
                counter!("studio_cache_revalidate_total", "result" => "ok").increment(1);
                debug!(key, op = "revalidate", result = "ok");
            }
            Ok(Err(err)) => {
                counter!("studio_cache_revalidate_total", "result" => "error").increment(1);
                warn!(
                    key,
                    op = "revalidate",
                    result = "producer_error",
                    error = %err,
                    "background revalidation failed"
                );
            }
            Err(_) => {
                counter!("studio_cache_revalidate_total", "result" => "error").increment(1);
                warn!(
                    key,
                    op = "revalidate",
                    result = "producer_panic",
                    "background revalidation panicked"
                );
            }
        }

        self.release(&HeldLock::acquired(&lock, token)).await;
    }

    /// Encode `data` as an entry expiring `ttl` from now. Kept synchronous so
    /// no borrow of `data` lives across an await point.
    fn encode_entry<T: Serialize>(
        &self,
        physical: &str,
        data: &T,
        ttl: Duration,
    ) -> Option<String> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            data,
            expires_at: self.clock.now_millis().saturating_add(ttl_ms),
        };
        match envelope::encode(&entry) {
            Ok(raw) => Some(raw),
            Err(err) => {
                warn!(key = physical, op = "set", error = %err, "computed value not cacheable");
                None
            }
        }
    }

    async fn write_entry(
        &self,
        physical: &str,
        raw: String,
        ttl: Duration,
        options: WrapOptions,
    ) {
        let physical_ttl =
            jitter_ttl_upward(ttl.saturating_add(options.grace()), self.config.jitter_ratio);
        if let Err(err) = self.store.set(physical, &raw, physical_ttl).await {
            self.backend_failed("set", physical, &err);
        }
    }

    async fn release(&self, lock: &HeldLock) {
        match self.store.delete_if_value(&lock.key, &lock.token).await {
            Ok(true) => {}
            Ok(false) => warn!(
                key = %lock.key,
                op = "release",
                result = "lock_lost",
                hint = "producer outlived the lock ttl",
                "lock expired before release; left to its current holder"
            ),
            Err(err) => self.backend_failed("del", &lock.key, &err),
        }
    }

    fn backend_failed(&self, op: &'static str, key: &str, err: &KvError) {
        counter!("studio_cache_backend_error_total", "op" => op).increment(1);
        warn!(
            key,
            op,
            backend = self.store.name(),
            error = %err,
            "cache backend call failed"
        );
    }
}
