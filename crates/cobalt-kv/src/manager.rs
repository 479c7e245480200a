//! Layer-keyed KV cache manager

use cobalt_runtime::DeviceMemoryPool;
use cobalt_types::{CobaltError, KvCacheConfig, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::entry::{KvCacheEntry, KvCacheStats, KvCacheView, KvSlice};

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<usize, KvCacheEntry>,
    total_cache_size: u64,
    peak_cache_size: u64,
    allocations: u64,
    reuse_hits: u64,
}

impl CacheState {
    fn insert(&mut self, entry: KvCacheEntry) {
        self.total_cache_size += entry.capacity_bytes();
        self.peak_cache_size = self.peak_cache_size.max(self.total_cache_size);
        self.allocations += 1;
        self.entries.insert(entry.layer_id, entry);
    }

    fn remove(&mut self, layer_id: usize) -> Option<KvCacheEntry> {
        let entry = self.entries.remove(&layer_id)?;
        self.total_cache_size -= entry.capacity_bytes();
        Some(entry)
    }

    fn entry_mut(&mut self, layer_id: usize) -> Result<&mut KvCacheEntry> {
        self.entries
            .get_mut(&layer_id)
            .ok_or_else(|| CobaltError::not_found(format!("no KV cache for layer {}", layer_id)))
    }
}

/// Owns the key/value buffers of every layer for one generation slot.
///
/// Buffers are laid out `[batch][position][head][head_dim]`. Size counters
/// are updated under the same lock as the entry map, so
/// `total_cache_size()` always equals the sum of live entry capacities.
#[derive(Debug)]
pub struct KvCacheManager {
    config: KvCacheConfig,
    pool: DeviceMemoryPool,
    state: Mutex<CacheState>,
}

impl KvCacheManager {
    pub fn new(config: KvCacheConfig, pool: DeviceMemoryPool) -> Result<Self> {
        config.validate()?;
        debug!(
            "Creating KV cache manager: device={}, layers={}, heads={}, head_dim={}, dtype={}",
            pool.device_id(),
            config.num_layers,
            config.num_heads,
            config.head_dim,
            config.dtype
        );
        Ok(Self {
            config,
            pool,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn config(&self) -> &KvCacheConfig {
        &self.config
    }

    fn check_shape(&self, batch_size: usize, sequence_length: usize) -> Result<()> {
        if batch_size == 0 || sequence_length == 0 {
            return Err(CobaltError::invalid_parameter(format!(
                "cache shape must be non-empty, got batch={} seq={}",
                batch_size, sequence_length
            )));
        }
        if batch_size > self.config.max_batch_size
            || sequence_length > self.config.max_sequence_length
        {
            return Err(CobaltError::invalid_parameter(format!(
                "cache shape batch={} seq={} exceeds limits batch={} seq={}",
                batch_size,
                sequence_length,
                self.config.max_batch_size,
                self.config.max_sequence_length
            )));
        }
        Ok(())
    }

    fn check_layer(&self, layer_id: usize) -> Result<()> {
        if layer_id >= self.config.num_layers {
            return Err(CobaltError::invalid_parameter(format!(
                "layer {} out of range (model has {})",
                layer_id, self.config.num_layers
            )));
        }
        Ok(())
    }

    /// Get a cache entry able to hold `batch_size × sequence_length` positions.
    ///
    /// An existing entry with enough capacity is reused as is and marked
    /// active. Otherwise the old entry is freed and a zeroed one of the
    /// requested shape takes its place.
    pub fn allocate_cache(
        &self,
        layer_id: usize,
        batch_size: usize,
        sequence_length: usize,
    ) -> Result<KvCacheView> {
        self.check_layer(layer_id)?;
        self.check_shape(batch_size, sequence_length)?;

        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&layer_id) {
            if entry.fits(batch_size, sequence_length) {
                entry.is_active = true;
                let view = entry.view();
                state.reuse_hits += 1;
                return Ok(view);
            }
        }

        if let Some(old) = state.remove(layer_id) {
            debug!(
                "layer {}: growing cache {}x{} -> {}x{}",
                layer_id, old.batch_size, old.sequence_length, batch_size, sequence_length
            );
        }

        let elements = batch_size * sequence_length * self.config.token_elements();
        let allocated = self
            .pool
            .allocate(elements, self.config.dtype)
            .and_then(|key| Ok((key, self.pool.allocate(elements, self.config.dtype)?)));
        let (key_cache, value_cache) = match allocated {
            Ok(buffers) => buffers,
            Err(e) => {
                warn!(
                    "layer {}: KV cache allocation of {} bytes failed: {}",
                    layer_id,
                    self.config.layer_bytes(batch_size, sequence_length),
                    e
                );
                return Err(e);
            }
        };

        let entry = KvCacheEntry {
            layer_id,
            key_cache,
            value_cache,
            batch_size,
            sequence_length,
            filled_length: 0,
            is_active: true,
        };
        let view = entry.view();
        state.insert(entry);
        debug!(
            "layer {}: allocated {} bytes (total {}, peak {})",
            layer_id, view.capacity_bytes, state.total_cache_size, state.peak_cache_size
        );
        Ok(view)
    }

    /// Allocate every layer of the model at the same shape.
    pub fn allocate_all(&self, batch_size: usize, sequence_length: usize) -> Result<()> {
        for layer in 0..self.config.num_layers {
            self.allocate_cache(layer, batch_size, sequence_length)?;
        }
        Ok(())
    }

    /// Write `sequence_length` positions for each of `batch_size` rows at `offset`.
    ///
    /// `key` and `value` are laid out `[batch][position][head][head_dim]`.
    /// Earlier positions are left untouched.
    pub fn update_cache(
        &self,
        layer_id: usize,
        key: &[f32],
        value: &[f32],
        batch_size: usize,
        sequence_length: usize,
        offset: usize,
    ) -> Result<()> {
        let te = self.config.token_elements();
        let expected = batch_size * sequence_length * te;
        if key.len() != expected || value.len() != expected {
            return Err(CobaltError::invalid_parameter(format!(
                "layer {}: expected {} elements per tensor, got key={} value={}",
                layer_id,
                expected,
                key.len(),
                value.len()
            )));
        }

        let mut state = self.state.lock();
        let entry = state.entry_mut(layer_id)?;
        if batch_size > entry.batch_size || offset + sequence_length > entry.sequence_length {
            return Err(CobaltError::invalid_parameter(format!(
                "layer {}: write of batch={} positions {}..{} exceeds capacity {}x{}",
                layer_id,
                batch_size,
                offset,
                offset + sequence_length,
                entry.batch_size,
                entry.sequence_length
            )));
        }

        let row_stride = entry.sequence_length * te;
        let chunk = sequence_length * te;
        for b in 0..batch_size {
            let dst = b * row_stride + offset * te;
            let src = b * chunk;
            entry.key_cache.write(dst, &key[src..src + chunk])?;
            entry.value_cache.write(dst, &value[src..src + chunk])?;
        }
        entry.filled_length = entry.filled_length.max(offset + sequence_length);
        Ok(())
    }

    /// Copy the first `length` positions of one batch row out of the cache.
    pub fn read_cache(&self, layer_id: usize, batch_index: usize, length: usize) -> Result<KvSlice> {
        let te = self.config.token_elements();
        let mut state = self.state.lock();
        let entry = state.entry_mut(layer_id)?;
        if batch_index >= entry.batch_size || length > entry.sequence_length {
            return Err(CobaltError::invalid_parameter(format!(
                "layer {}: read of row {} length {} exceeds capacity {}x{}",
                layer_id, batch_index, length, entry.batch_size, entry.sequence_length
            )));
        }
        let start = batch_index * entry.sequence_length * te;
        Ok(KvSlice {
            keys: entry.key_cache.read(start, length * te)?,
            values: entry.value_cache.read(start, length * te)?,
        })
    }

    /// Rebuild batch rows from parents: row `i` becomes a copy of row `parents[i]`.
    ///
    /// Only the first `length` positions are copied. Used when beams are
    /// re-ranked between steps.
    pub fn reorder_batch(&self, layer_id: usize, parents: &[usize], length: usize) -> Result<()> {
        let te = self.config.token_elements();
        let mut state = self.state.lock();
        let entry = state.entry_mut(layer_id)?;
        if parents.len() > entry.batch_size
            || parents.iter().any(|p| *p >= entry.batch_size)
            || length > entry.sequence_length
        {
            return Err(CobaltError::invalid_parameter(format!(
                "layer {}: invalid reorder {:?} over {} rows",
                layer_id, parents, entry.batch_size
            )));
        }
        if parents.iter().enumerate().all(|(i, p)| i == *p) {
            return Ok(());
        }

        let row_stride = entry.sequence_length * te;
        let span = length * te;
        let mut keys = Vec::with_capacity(parents.len());
        let mut values = Vec::with_capacity(parents.len());
        for p in parents {
            keys.push(entry.key_cache.read(p * row_stride, span)?);
            values.push(entry.value_cache.read(p * row_stride, span)?);
        }
        for (i, (k, v)) in keys.iter().zip(&values).enumerate() {
            entry.key_cache.write(i * row_stride, k)?;
            entry.value_cache.write(i * row_stride, v)?;
        }
        Ok(())
    }

    pub fn get_cache(&self, layer_id: usize) -> Result<KvCacheView> {
        let mut state = self.state.lock();
        Ok(state.entry_mut(layer_id)?.view())
    }

    /// Zero every live buffer, keeping the allocations.
    pub fn clear_cache(&self) {
        let mut state = self.state.lock();
        for entry in state.entries.values_mut() {
            entry.key_cache.fill_zero();
            entry.value_cache.fill_zero();
            entry.filled_length = 0;
        }
        debug!("cleared {} KV cache entries", state.entries.len());
    }

    /// Mark a layer's entry idle without freeing it.
    pub fn release_cache(&self, layer_id: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.entry_mut(layer_id)?.is_active = false;
        Ok(())
    }

    /// Mark every entry idle.
    pub fn release_all(&self) {
        let mut state = self.state.lock();
        state.entries.values_mut().for_each(|e| e.is_active = false);
    }

    /// Free a layer's buffers. Returns whether anything was freed.
    pub fn deallocate_cache(&self, layer_id: usize) -> bool {
        let freed = self.state.lock().remove(layer_id);
        match freed {
            Some(entry) => {
                debug!(
                    "layer {}: freed {} bytes",
                    layer_id,
                    entry.capacity_bytes()
                );
                true
            }
            None => false,
        }
    }

    /// Free every buffer.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let layers: Vec<usize> = state.entries.keys().copied().collect();
        for layer in layers {
            state.remove(layer);
        }
    }

    pub fn total_cache_size(&self) -> u64 {
        self.state.lock().total_cache_size
    }

    pub fn peak_cache_size(&self) -> u64 {
        self.state.lock().peak_cache_size
    }

    /// Bytes held by entries that are allocated but idle
    pub fn free_cache_size(&self) -> u64 {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_active)
            .map(|e| e.capacity_bytes())
            .sum()
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn stats(&self) -> KvCacheStats {
        let state = self.state.lock();
        KvCacheStats {
            live_entries: state.entries.len(),
            active_entries: state.entries.values().filter(|e| e.is_active).count(),
            total_cache_bytes: state.total_cache_size,
            peak_cache_bytes: state.peak_cache_size,
            free_cache_bytes: state
                .entries
                .values()
                .filter(|e| !e.is_active)
                .map(|e| e.capacity_bytes())
                .sum(),
            allocations: state.allocations,
            reuse_hits: state.reuse_hits,
        }
    }
}
