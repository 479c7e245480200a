//! Budgeted device memory with owning buffer handles

use cobalt_types::{CobaltError, DataType, Result};
use half::f16;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::stats::{MemoryStats, MemoryStatsTracker};

struct PoolInner {
    device_id: u32,
    limit_bytes: u64,
    next_handle: AtomicU64,
    tracker: MemoryStatsTracker,
}

impl PoolInner {
    fn release(&self, handle: u64, size: u64) {
        self.tracker.record_release(size);
        debug!(
            "device {} released handle {} ({} bytes)",
            self.device_id, handle, size
        );
    }
}

/// Memory budget of one accelerator device.
///
/// Every byte handed out is represented by a [`DeviceBuffer`] or a
/// [`MemoryReservation`]; dropping the handle returns the bytes to the pool,
/// so usage is always the sum of live handles.
#[derive(Clone)]
pub struct DeviceMemoryPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for DeviceMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemoryPool")
            .field("device_id", &self.inner.device_id)
            .field("limit_bytes", &self.inner.limit_bytes)
            .field("used_bytes", &self.used_bytes())
            .finish()
    }
}

impl DeviceMemoryPool {
    pub fn new(device_id: u32, limit_bytes: u64) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                device_id,
                limit_bytes,
                next_handle: AtomicU64::new(1),
                tracker: MemoryStatsTracker::default(),
            }),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.inner.device_id
    }

    pub fn limit_bytes(&self) -> u64 {
        self.inner.limit_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.tracker.current_usage()
    }

    pub fn available_bytes(&self) -> u64 {
        self.inner.limit_bytes.saturating_sub(self.used_bytes())
    }

    /// Successful allocations and reservations over the pool's lifetime
    pub fn allocation_count(&self) -> u64 {
        self.inner.tracker.allocation_count()
    }

    pub fn stats(&self) -> MemoryStats {
        self.inner
            .tracker
            .snapshot(self.inner.device_id, self.inner.limit_bytes)
    }

    /// Allocate a zero-initialised buffer of `elements` values of `dtype`.
    pub fn allocate(&self, elements: usize, dtype: DataType) -> Result<DeviceBuffer> {
        if elements == 0 {
            return Err(CobaltError::invalid_parameter(
                "cannot allocate an empty device buffer",
            ));
        }
        let size = (elements as u64)
            .checked_mul(dtype.size_bytes() as u64)
            .ok_or_else(|| CobaltError::allocation("buffer size overflows u64"))?;

        if !self.inner.tracker.try_claim(size, self.inner.limit_bytes) {
            warn!(
                "device {} out of memory: requested {} bytes, {} of {} in use",
                self.inner.device_id,
                size,
                self.used_bytes(),
                self.inner.limit_bytes
            );
            return Err(CobaltError::allocation(format!(
                "device {} cannot fit {} bytes ({} available)",
                self.inner.device_id,
                size,
                self.available_bytes()
            )));
        }

        let storage = match BufferStorage::zeroed(elements, dtype) {
            Ok(storage) => storage,
            Err(e) => {
                self.inner.tracker.rollback(size);
                return Err(e);
            }
        };

        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(
            "device {} allocated handle {} ({} x {} = {} bytes)",
            self.inner.device_id, handle, elements, dtype, size
        );
        Ok(DeviceBuffer {
            handle,
            size,
            storage,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Reserve `size` bytes without backing storage (model weights).
    pub fn reserve(&self, size: u64, label: impl Into<String>) -> Result<MemoryReservation> {
        let label = label.into();
        if !self.inner.tracker.try_claim(size, self.inner.limit_bytes) {
            return Err(CobaltError::resource_exhausted(format!(
                "device {} cannot reserve {} bytes for {} ({} available)",
                self.inner.device_id,
                size,
                label,
                self.available_bytes()
            )));
        }
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(
            "device {} reserved {} bytes for {} (handle {})",
            self.inner.device_id, size, label, handle
        );
        Ok(MemoryReservation {
            handle,
            size,
            label,
            pool: Arc::clone(&self.inner),
        })
    }
}

enum BufferStorage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl BufferStorage {
    fn zeroed(elements: usize, dtype: DataType) -> Result<Self> {
        let oom = |e: std::collections::TryReserveError| {
            CobaltError::allocation(format!("host backing store unavailable: {}", e))
        };
        Ok(match dtype {
            DataType::FP32 => {
                let mut v = Vec::new();
                v.try_reserve_exact(elements).map_err(oom)?;
                v.resize(elements, 0.0f32);
                BufferStorage::F32(v)
            }
            DataType::FP16 => {
                let mut v = Vec::new();
                v.try_reserve_exact(elements).map_err(oom)?;
                v.resize(elements, f16::ZERO);
                BufferStorage::F16(v)
            }
        })
    }

    fn len(&self) -> usize {
        match self {
            BufferStorage::F32(v) => v.len(),
            BufferStorage::F16(v) => v.len(),
        }
    }
}

/// Owning handle to a device buffer; frees its bytes on drop.
pub struct DeviceBuffer {
    handle: u64,
    size: u64,
    storage: BufferStorage,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("device_id", &self.pool.device_id)
            .field("dtype", &self.dtype())
            .field("size", &self.size)
            .finish()
    }
}

impl DeviceBuffer {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn dtype(&self) -> DataType {
        match self.storage {
            BufferStorage::F32(_) => DataType::FP32,
            BufferStorage::F16(_) => DataType::FP16,
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(CobaltError::invalid_parameter(format!(
                "range {}..{} out of bounds for buffer {} of {} elements",
                offset,
                offset.saturating_add(len),
                self.handle,
                self.len()
            ))),
        }
    }

    /// Zero every element without releasing the allocation.
    pub fn fill_zero(&mut self) {
        match &mut self.storage {
            BufferStorage::F32(v) => v.fill(0.0),
            BufferStorage::F16(v) => v.fill(f16::ZERO),
        }
    }

    /// Copy `data` into the buffer starting at element `offset`.
    pub fn write(&mut self, offset: usize, data: &[f32]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let end = offset + data.len();
        match &mut self.storage {
            BufferStorage::F32(v) => v[offset..end].copy_from_slice(data),
            BufferStorage::F16(v) => {
                for (dst, src) in v[offset..end].iter_mut().zip(data) {
                    *dst = f16::from_f32(*src);
                }
            }
        }
        Ok(())
    }

    /// Read `out.len()` elements starting at `offset` into `out`.
    pub fn read_into(&self, offset: usize, out: &mut [f32]) -> Result<()> {
        self.check_range(offset, out.len())?;
        let end = offset + out.len();
        match &self.storage {
            BufferStorage::F32(v) => out.copy_from_slice(&v[offset..end]),
            BufferStorage::F16(v) => {
                for (dst, src) in out.iter_mut().zip(&v[offset..end]) {
                    *dst = src.to_f32();
                }
            }
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<f32>> {
        let mut out = vec![0.0; len];
        self.read_into(offset, &mut out)?;
        Ok(out)
    }

    /// Device-side copy of `len` elements from `src` to `dst` (ranges may overlap).
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        self.check_range(src, len)?;
        self.check_range(dst, len)?;
        match &mut self.storage {
            BufferStorage::F32(v) => v.copy_within(src..src + len, dst),
            BufferStorage::F16(v) => v.copy_within(src..src + len, dst),
        }
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.pool.release(self.handle, self.size);
    }
}

/// Bytes held against the budget without backing storage; freed on drop.
pub struct MemoryReservation {
    handle: u64,
    size: u64,
    label: String,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for MemoryReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryReservation")
            .field("handle", &self.handle)
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

impl MemoryReservation {
    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.pool.release(self.handle, self.size);
    }
}
