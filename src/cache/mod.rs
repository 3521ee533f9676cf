//! Studio Cache System
//!
//! Cache-aside layer shared by every API process:
//!
//! - **Store**: the KV adapter (`MemoryStore`, or `RedisStore` from `infra`)
//! - **Envelope**: JSON encoding that keeps big integers and timestamps typed
//! - **Keys**: hierarchical key and wildcard-pattern builders
//! - **Engine**: `wrap` with stampede protection and stale-while-revalidate,
//!   plus the direct get/set/delete invalidation API
//!
//! ## Configuration
//!
//! Engine tunables come from the `[cache]` section of `studio-cache.toml`,
//! loaded and validated by [`crate::config::load`]:
//!
//! ```toml
//! [cache]
//! prefix = "studio"
//! lock_ttl_seconds = 10
//! lock_retry_delay_ms = 200
//! # ... see `crate::config` for all options
//! ```

mod clock;
mod config;
mod engine;
pub mod envelope;
mod jitter;
mod keys;
mod lock;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use engine::{Cache, CacheEntry, WrapError, WrapOptions};
pub use envelope::{CacheValue, EnvelopeError, decode, encode};
pub use jitter::{jitter_ttl, jitter_ttl_upward};
pub use keys::{CacheKey, CachePurpose, Scope, background_lock_key, fingerprint_filters, lock_key};
pub use store::{KvError, KvStore, MemoryStore, glob_match};
