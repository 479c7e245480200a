//! Generation slots: one compute stream plus the KV cache it writes

use cobalt_kv::KvCacheManager;
use cobalt_runtime::{ComputeBackend, DeviceMemoryPool};
use cobalt_types::{CobaltError, KvCacheConfig, ModelSpec, Result, StreamId};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A compute stream and the cache manager serving requests on it
#[derive(Debug)]
pub struct StreamSlot {
    pub stream: StreamId,
    pub cache: KvCacheManager,
}

impl StreamSlot {
    /// Make the slot's cache match `spec`, rebuilding it when the layer shape differs
    /// or the sequence limit is too small. Returns whether a rebuild happened.
    pub fn prepare(
        &mut self,
        spec: &ModelSpec,
        sequence_length: usize,
        pool: &DeviceMemoryPool,
    ) -> Result<bool> {
        let current = self.cache.config();
        if current.num_layers == spec.num_layers
            && current.num_heads == spec.num_heads
            && current.head_dim == spec.head_dim
            && current.max_sequence_length >= sequence_length
        {
            return Ok(false);
        }
        let config = KvCacheConfig {
            num_layers: spec.num_layers,
            num_heads: spec.num_heads,
            head_dim: spec.head_dim,
            max_sequence_length: current.max_sequence_length.max(sequence_length),
            ..current.clone()
        };
        debug!(
            "{}: rebuilding KV cache for {} layers x {} heads x {}",
            self.stream, config.num_layers, config.num_heads, config.head_dim
        );
        self.cache.cleanup();
        self.cache = KvCacheManager::new(config, pool.clone())?;
        Ok(true)
    }

    /// Wipe per-request state while keeping the buffers warm
    pub fn recycle(&self) {
        self.cache.clear_cache();
        self.cache.release_all();
    }
}

/// Idle slots plus lease bookkeeping, guarded together
#[derive(Debug, Default)]
struct SlotTable {
    idle: Vec<StreamSlot>,
    leased: usize,
    /// Set by `destroy`; slots released afterwards are torn down instead of kept
    retired: bool,
}

/// Fixed set of generation slots shared by a node's concurrent requests.
///
/// `acquire` blocks until a slot is free, so at most `capacity` requests
/// generate at once; the rest wait in `waiting()`.
pub struct StreamPool {
    backend: Arc<dyn ComputeBackend>,
    device_id: u32,
    slots: Mutex<SlotTable>,
    available: Condvar,
    capacity: usize,
    waiting: AtomicUsize,
}

impl std::fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPool")
            .field("backend", &self.backend.name())
            .field("device_id", &self.device_id)
            .field("capacity", &self.capacity)
            .field("slots", &*self.slots.lock())
            .finish()
    }
}

impl StreamPool {
    /// Create `count` streams on `device_id`, each with its own cache manager.
    ///
    /// Streams created before a failure are destroyed again.
    pub fn create(
        backend: Arc<dyn ComputeBackend>,
        device_id: u32,
        count: usize,
        kv_config: &KvCacheConfig,
        pool: &DeviceMemoryPool,
    ) -> Result<Self> {
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let made = backend.create_stream(device_id).and_then(|stream| {
                match KvCacheManager::new(kv_config.clone(), pool.clone()) {
                    Ok(cache) => Ok(StreamSlot { stream, cache }),
                    Err(e) => {
                        let _ = backend.destroy_stream(device_id, stream);
                        Err(e)
                    }
                }
            });
            match made {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots.drain(..) {
                        slot.cache.cleanup();
                        let _ = backend.destroy_stream(device_id, slot.stream);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            backend,
            device_id,
            slots: Mutex::new(SlotTable {
                idle: slots,
                ..Default::default()
            }),
            available: Condvar::new(),
            capacity: count,
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests blocked waiting for a slot
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Slots currently leased out
    pub fn in_use(&self) -> usize {
        self.slots.lock().leased
    }

    /// Bytes held by the caches of idle slots
    pub fn idle_cache_bytes(&self) -> u64 {
        self.slots
            .lock()
            .idle
            .iter()
            .map(|s| s.cache.total_cache_size())
            .sum()
    }

    /// Block until a slot is free and lease it. Fails once the pool is destroyed.
    pub fn acquire(&self) -> Result<StreamLease<'_>> {
        let mut slots = self.slots.lock();
        if slots.idle.is_empty() && !slots.retired {
            self.waiting.fetch_add(1, Ordering::Relaxed);
            while slots.idle.is_empty() && !slots.retired {
                self.available.wait(&mut slots);
            }
            self.waiting.fetch_sub(1, Ordering::Relaxed);
        }
        if slots.retired {
            return Err(CobaltError::invalid_state(format!(
                "streams of device {} have been destroyed",
                self.device_id
            )));
        }
        let slot = slots.idle.pop();
        slots.leased += 1;
        Ok(StreamLease { pool: self, slot })
    }

    pub fn try_acquire(&self) -> Option<StreamLease<'_>> {
        let mut slots = self.slots.lock();
        let slot = slots.idle.pop()?;
        slots.leased += 1;
        Some(StreamLease {
            pool: self,
            slot: Some(slot),
        })
    }

    fn release(&self, slot: StreamSlot) {
        let mut slots = self.slots.lock();
        slots.leased -= 1;
        if slots.retired {
            drop(slots);
            self.teardown(slot);
            return;
        }
        slot.recycle();
        slots.idle.push(slot);
        drop(slots);
        self.available.notify_one();
    }

    fn teardown(&self, slot: StreamSlot) {
        slot.cache.cleanup();
        if let Err(e) = self.backend.destroy_stream(self.device_id, slot.stream) {
            warn!("failed to destroy {}: {}", slot.stream, e);
        }
    }

    /// Free every idle slot's cache and destroy its stream.
    ///
    /// Leased slots are torn down when their lease ends; blocked and later
    /// `acquire` calls fail.
    pub fn destroy(&self) {
        let idle = {
            let mut slots = self.slots.lock();
            slots.retired = true;
            std::mem::take(&mut slots.idle)
        };
        self.available.notify_all();
        debug!(
            "destroying {} idle streams on device {}",
            idle.len(),
            self.device_id
        );
        for slot in idle {
            self.teardown(slot);
        }
    }
}

/// Exclusive use of one [`StreamSlot`]; the slot goes back to its pool on drop.
#[derive(Debug)]
pub struct StreamLease<'a> {
    pool: &'a StreamPool,
    slot: Option<StreamSlot>,
}

impl Deref for StreamLease<'_> {
    type Target = StreamSlot;

    fn deref(&self) -> &StreamSlot {
        // only None after drop has taken it
        self.slot.as_ref().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl DerefMut for StreamLease<'_> {
    fn deref_mut(&mut self) -> &mut StreamSlot {
        self.slot.as_mut().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl Drop for StreamLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}
