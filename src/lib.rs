//! Hybrid Cache - persistent two-tier blob cache
//!
//! Payloads are kept in memory up to a byte budget and written back lazily
//! to a single compacted data file with its own budget. A small binary
//! index records where every entry lives so the cache survives restarts.

pub mod access_gate;
pub mod cache_policy;
pub mod cache_types;
pub mod config;
pub mod data_store;
pub mod error;
pub mod hybrid_cache;
pub mod index_file;
pub mod logging;

pub use cache_policy::{CachePolicy, EvictionAlgorithm, LfuCachePolicy, LruCachePolicy};
pub use cache_types::{key_hash, Timestamp};
pub use config::{CacheConfig, Config, LoggingConfig};
pub use error::{CacheError, Result};
pub use hybrid_cache::{CacheStats, HybridCache};
