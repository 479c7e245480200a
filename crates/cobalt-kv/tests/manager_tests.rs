use cobalt_kv::*;
use cobalt_runtime::DeviceMemoryPool;
use cobalt_types::DataType;

fn config() -> KvCacheConfig {
    KvCacheConfig {
        max_batch_size: 8,
        max_sequence_length: 128,
        num_heads: 4,
        head_dim: 8,
        num_layers: 4,
        dtype: DataType::FP16,
    }
}

fn live_capacity(m: &KvCacheManager) -> u64 {
    (0..m.config().num_layers)
        .filter_map(|l| m.get_cache(l).ok())
        .map(|v| v.capacity_bytes)
        .sum()
}

#[test]
fn construction_rejects_zero_dimensions() {
    let pool = DeviceMemoryPool::new(0, 1 << 20);
    let mut cfg = config();
    cfg.num_heads = 0;
    let err = KvCacheManager::new(cfg, pool).unwrap_err();
    assert!(matches!(err, CobaltError::Config { .. }));
}

#[test]
fn reuse_within_capacity_never_reallocates() {
    let pool = DeviceMemoryPool::new(0, 64 << 20);
    let m = KvCacheManager::new(config(), pool.clone()).unwrap();

    m.allocate_cache(0, 4, 64).unwrap();
    let device_allocs = pool.allocation_count();
    let first = m.get_cache(0).unwrap();

    // non-decreasing shapes within the first allocation
    for (b, s) in [(1, 1), (1, 8), (2, 8), (2, 32), (4, 32), (4, 64)] {
        let view = m.allocate_cache(0, b, s).unwrap();
        assert_eq!(view.key_handle, first.key_handle);
        assert!(view.batch_size >= b && view.sequence_length >= s);
    }
    assert_eq!(pool.allocation_count(), device_allocs);
    assert_eq!(m.stats().reuse_hits, 6);
    assert_eq!(m.stats().allocations, 1);
}

#[test]
fn growth_reallocates_once_and_keeps_accounting() {
    let pool = DeviceMemoryPool::new(0, 64 << 20);
    let cfg = config();
    let m = KvCacheManager::new(cfg.clone(), pool.clone()).unwrap();

    m.allocate_cache(0, 1, 16).unwrap();
    assert_eq!(m.total_cache_size(), cfg.layer_bytes(1, 16));

    let grown = m.allocate_cache(0, 2, 32).unwrap();
    assert_eq!(grown.capacity_bytes, cfg.layer_bytes(2, 32));
    assert_eq!(m.total_cache_size(), cfg.layer_bytes(2, 32));
    assert_eq!(m.peak_cache_size(), cfg.layer_bytes(2, 32));
    assert_eq!(pool.used_bytes(), m.total_cache_size());
    assert_eq!(m.stats().allocations, 2);
}

#[test]
fn accounting_holds_across_interleaved_operations() {
    let pool = DeviceMemoryPool::new(0, 64 << 20);
    let m = KvCacheManager::new(config(), pool.clone()).unwrap();

    m.allocate_cache(0, 1, 8).unwrap();
    m.allocate_cache(1, 2, 8).unwrap();
    assert_eq!(m.total_cache_size(), live_capacity(&m));

    m.allocate_cache(2, 1, 64).unwrap();
    assert!(m.deallocate_cache(1));
    assert_eq!(m.total_cache_size(), live_capacity(&m));

    m.clear_cache();
    assert_eq!(m.total_cache_size(), live_capacity(&m));

    m.allocate_cache(0, 8, 8).unwrap();
    assert_eq!(m.total_cache_size(), live_capacity(&m));
    assert_eq!(pool.used_bytes(), m.total_cache_size());

    let peak = m.peak_cache_size();
    m.cleanup();
    assert_eq!(m.total_cache_size(), 0);
    assert_eq!(live_capacity(&m), 0);
    assert_eq!(pool.used_bytes(), 0);
    assert_eq!(m.peak_cache_size(), peak);
}

#[test]
fn whole_model_total_matches_sizing_rule() {
    let pool = DeviceMemoryPool::new(0, 64 << 20);
    let cfg = config();
    let m = KvCacheManager::new(cfg.clone(), pool).unwrap();
    m.allocate_all(2, 16).unwrap();
    assert_eq!(m.total_cache_size(), cfg.model_bytes(2, 16));
    assert_eq!(
        cfg.model_bytes(2, 16),
        (2 * 16 * 4 * 8 * 2 * 2 * 4) as u64
    );
}

#[test]
fn clear_zeroes_without_freeing() {
    let pool = DeviceMemoryPool::new(0, 1 << 20);
    let m = KvCacheManager::new(config(), pool.clone()).unwrap();
    m.allocate_cache(0, 1, 4).unwrap();
    m.update_cache(0, &[1.5; 32], &[2.5; 32], 1, 1, 0).unwrap();
    let before = m.total_cache_size();
    let allocs = pool.allocation_count();

    m.clear_cache();
    let slice = m.read_cache(0, 0, 1).unwrap();
    assert!(slice.keys.iter().chain(&slice.values).all(|v| *v == 0.0));
    assert_eq!(m.total_cache_size(), before);
    assert_eq!(pool.allocation_count(), allocs);
}

#[test]
fn out_of_memory_is_reported_and_state_stays_consistent() {
    let cfg = config();
    // room for exactly one 1x16 layer
    let pool = DeviceMemoryPool::new(0, cfg.layer_bytes(1, 16));
    let m = KvCacheManager::new(cfg.clone(), pool.clone()).unwrap();

    m.allocate_cache(0, 1, 16).unwrap();
    let err = m.allocate_cache(1, 1, 16).unwrap_err();
    assert!(matches!(err, CobaltError::Allocation { .. }));
    assert!(err.is_retryable());
    assert_eq!(m.entry_count(), 1);
    assert_eq!(m.total_cache_size(), cfg.layer_bytes(1, 16));
    assert_eq!(pool.used_bytes(), m.total_cache_size());

    // freeing the first layer makes room again
    assert!(m.deallocate_cache(0));
    m.allocate_cache(1, 1, 16).unwrap();
}

#[test]
fn deallocate_is_idempotent() {
    let pool = DeviceMemoryPool::new(0, 1 << 20);
    let m = KvCacheManager::new(config(), pool).unwrap();
    m.allocate_cache(2, 1, 4).unwrap();
    assert!(m.deallocate_cache(2));
    let total = m.total_cache_size();
    assert!(!m.deallocate_cache(2));
    assert_eq!(m.total_cache_size(), total);
    assert!(matches!(m.get_cache(2), Err(CobaltError::NotFound { .. })));
}

#[test]
fn released_entries_count_as_free_cache() {
    let pool = DeviceMemoryPool::new(0, 1 << 20);
    let cfg = config();
    let m = KvCacheManager::new(cfg.clone(), pool).unwrap();
    m.allocate_cache(0, 1, 4).unwrap();
    m.allocate_cache(1, 1, 4).unwrap();
    m.release_cache(1).unwrap();

    assert_eq!(m.free_cache_size(), cfg.layer_bytes(1, 4));
    assert_eq!(m.stats().active_entries, 1);

    // reuse reactivates
    assert!(m.allocate_cache(1, 1, 2).unwrap().is_active);
    assert_eq!(m.free_cache_size(), 0);
    assert!(m.release_cache(3).is_err());
}

#[test]
fn dropping_the_manager_frees_device_memory() {
    let pool = DeviceMemoryPool::new(0, 1 << 20);
    {
        let m = KvCacheManager::new(config(), pool.clone()).unwrap();
        m.allocate_all(1, 8).unwrap();
        assert!(pool.used_bytes() > 0);
    }
    assert_eq!(pool.used_bytes(), 0);
}
