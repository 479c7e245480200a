//! Cache entries and their public views

use cobalt_runtime::DeviceBuffer;
use serde::{Deserialize, Serialize};

/// Key/value buffers of one layer
#[derive(Debug)]
pub(crate) struct KvCacheEntry {
    pub(crate) layer_id: usize,
    pub(crate) key_cache: DeviceBuffer,
    pub(crate) value_cache: DeviceBuffer,
    /// Batch rows the buffers were sized for
    pub(crate) batch_size: usize,
    /// Token positions per batch row the buffers were sized for
    pub(crate) sequence_length: usize,
    /// Highest position written since the last clear
    pub(crate) filled_length: usize,
    pub(crate) is_active: bool,
}

impl KvCacheEntry {
    pub(crate) fn capacity_bytes(&self) -> u64 {
        self.key_cache.size_bytes() + self.value_cache.size_bytes()
    }

    pub(crate) fn fits(&self, batch_size: usize, sequence_length: usize) -> bool {
        self.batch_size >= batch_size && self.sequence_length >= sequence_length
    }

    pub(crate) fn view(&self) -> KvCacheView {
        KvCacheView {
            layer_id: self.layer_id,
            batch_size: self.batch_size,
            sequence_length: self.sequence_length,
            filled_length: self.filled_length,
            capacity_bytes: self.capacity_bytes(),
            is_active: self.is_active,
            key_handle: self.key_cache.handle(),
            value_handle: self.value_cache.handle(),
        }
    }
}

/// Read-only description of a layer's cache entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheView {
    pub layer_id: usize,
    pub batch_size: usize,
    pub sequence_length: usize,
    pub filled_length: usize,
    /// Bytes held by the key and value buffers together
    pub capacity_bytes: u64,
    pub is_active: bool,
    pub key_handle: u64,
    pub value_handle: u64,
}

/// Keys and values copied out of one batch row
#[derive(Debug, Clone, PartialEq)]
pub struct KvSlice {
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
}

/// Counters of a cache manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheStats {
    pub live_entries: usize,
    pub active_entries: usize,
    pub total_cache_bytes: u64,
    pub peak_cache_bytes: u64,
    /// Bytes held by entries released but not freed
    pub free_cache_bytes: u64,
    /// Entry (re)allocations, each allocating a key and a value buffer
    pub allocations: u64,
    /// Allocation requests served from an existing entry
    pub reuse_hits: u64,
}
