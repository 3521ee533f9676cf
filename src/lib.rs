//! Read-through distributed cache layer for the studio directory and blog API.
//!
//! Listing, detail and search read paths wrap their expensive queries with
//! [`cache::Cache::wrap`]; mutation paths evict keys or whole key families
//! through the invalidation half of the same handle. All cross-process
//! coordination goes through the shared KV store.

pub mod cache;
pub mod config;
pub mod infra;
