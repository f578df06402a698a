//! Caching layer for regrade-core
//!
//! Persists fetched threads so repeat runs only fetch what is new.

pub mod regrade_cache;

pub use regrade_cache::{CacheStats, RegradeCache, CACHE_FILE};
