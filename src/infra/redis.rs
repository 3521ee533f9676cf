//! Redis-backed [`KvStore`] over a `deadpool-redis` connection pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::debug;

use crate::cache::{KvError, KvStore};
use crate::config::RedisSettings;

use super::error::InfraError;

/// Keys requested per `SCAN` round trip.
const SCAN_COUNT: usize = 500;
/// Keys per `DEL` when deleting a batch.
const DELETE_CHUNK: usize = 500;
/// Compare-and-delete so only the holder of a lock token can release it.
const DELETE_IF_VALUE_SCRIPT: &str = r#"if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0"#;

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.pool.status();
        f.debug_struct("RedisStore")
            .field("max_size", &status.max_size)
            .field("size", &status.size)
            .finish()
    }
}

impl RedisStore {
    /// Build the pool. No connection is opened until the first command.
    pub fn connect(settings: &RedisSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::configuration("redis.url is not set"))?;

        let pool_size = usize::try_from(settings.pool_size.get())
            .map_err(|_| InfraError::configuration("redis.pool_size exceeds usize"))?;

        let pool = Config::from_url(url)
            .builder()
            .map_err(|err| InfraError::redis(format!("invalid pool config: {err}")))?
            .max_size(pool_size)
            .wait_timeout(Some(settings.timeout))
            .create_timeout(Some(settings.timeout))
            .recycle_timeout(Some(settings.timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|err| InfraError::redis(format!("failed to build pool: {err}")))?;

        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Connection, KvError> {
        self.pool
            .get()
            .await
            .map_err(|err| KvError::unavailable(format!("redis pool: {err}")))
    }
}

fn command_error(op: &'static str, err: redis::RedisError) -> KvError {
    if err.is_io_error() || err.is_timeout() {
        KvError::unavailable(format!("redis {op}: {err}"))
    } else {
        KvError::command(format!("redis {op}: {err}"))
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|err| command_error("GET", err))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.connection().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|err| command_error("SET", err))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(|err| command_error("SET NX", err))?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<usize>(&mut conn)
            .await
            .map_err(|err| command_error("DEL", err))?;
        Ok(removed > 0)
    }

    async fn delete_if_value(&self, key: &str, value: &str) -> Result<bool, KvError> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("EVAL")
            .arg(DELETE_IF_VALUE_SCRIPT)
            .arg(1)
            .arg(key)
            .arg(value)
            .query_async::<usize>(&mut conn)
            .await
            .map_err(|err| command_error("EVAL", err))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, KvError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let mut removed = 0usize;
        for chunk in keys.chunks(DELETE_CHUNK) {
            removed += redis::cmd("DEL")
                .arg(chunk)
                .query_async::<usize>(&mut conn)
                .await
                .map_err(|err| command_error("DEL", err))?;
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        let mut rounds = 0u32;
        loop {
            let (next, batch) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async::<(u64, Vec<String>)>(&mut conn)
                .await
                .map_err(|err| command_error("SCAN", err))?;
            keys.extend(batch);
            rounds += 1;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once across rounds.
        keys.sort_unstable();
        keys.dedup();
        debug!(op = "scan", pattern, rounds, matched = keys.len(), "redis scan finished");
        Ok(keys)
    }

    async fn shutdown(&self) {
        self.pool.close();
        debug!(op = "shutdown", "redis pool closed");
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use super::*;

    fn settings(url: &str) -> RedisSettings {
        RedisSettings {
            url: Some(url.to_string()),
            pool_size: NonZeroU32::new(4).expect("non-zero"),
            timeout: Duration::from_millis(250),
        }
    }

    #[test]
    fn connect_builds_pool_without_network() {
        let store = RedisStore::connect(&settings("redis://127.0.0.1:6399/0")).expect("pool");
        assert_eq!(store.name(), "redis");
        assert_eq!(store.pool.status().max_size, 4);
    }

    #[test]
    fn connect_requires_url() {
        let mut settings = settings("redis://127.0.0.1:6399/0");
        settings.url = None;
        let err = RedisStore::connect(&settings).expect_err("no url");
        assert!(matches!(err, InfraError::Configuration { .. }));
    }

    #[test]
    fn ttl_is_at_least_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2_000);
    }
}
