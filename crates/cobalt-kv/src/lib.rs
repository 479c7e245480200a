//! # cobalt-kv
//!
//! Per-layer key/value cache management. A [`KvCacheManager`] owns one entry
//! per transformer layer, backed by buffers from a device memory pool, and
//! keeps exact byte accounting across allocate, reuse, clear and free.

pub mod entry;
pub mod manager;

pub use entry::{KvCacheStats, KvCacheView, KvSlice};
pub use manager::KvCacheManager;

pub use cobalt_types::{CobaltError, KvCacheConfig, Result};
