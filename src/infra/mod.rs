//! Infrastructure adapters and runtime bootstrap.

pub mod error;
#[cfg(feature = "redis")]
pub mod redis;
pub mod telemetry;

use std::sync::Arc;

use crate::cache::{KvStore, MemoryStore};
use crate::config::RedisSettings;

use self::error::InfraError;

/// Build the key-value store selected by the settings.
///
/// Without a Redis URL the in-process [`MemoryStore`] is used, which only
/// coordinates callers inside this process.
pub fn build_store(settings: &RedisSettings) -> Result<Arc<dyn KvStore>, InfraError> {
    match settings.url.as_deref() {
        None => {
            tracing::info!(store = "memory", "cache store selected");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "redis")]
        Some(_) => {
            let store = redis::RedisStore::connect(settings)?;
            tracing::info!(
                store = "redis",
                pool_size = settings.pool_size.get(),
                "cache store selected"
            );
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(InfraError::configuration(
            "redis.url is set but the `redis` feature is disabled",
        )),
    }
}
