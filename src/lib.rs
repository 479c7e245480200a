//! # Cobalt Infer
//!
//! Accelerator-resident serving core for autoregressive language models.
//!
//! ## Architecture
//!
//! - [`cobalt_kv`]: per-layer key/value cache with exact byte accounting
//! - [`cobalt_sampler`]: greedy, temperature, top-k, top-p and beam decoding
//! - [`cobalt_engine`]: transformer step executor and virtual compute nodes
//! - [`cobalt_scheduler`]: resource-aware placement across nodes
//!
//! This crate wires them together from a [`Config`].

pub mod config;
pub mod utils;

pub use cobalt_engine::{
    ModelRegistry, StaticModelRegistry, TransformerStepExecutor, VirtualComputeNode,
};
pub use cobalt_kv::KvCacheManager;
pub use cobalt_runtime::{ComputeBackend, DeviceMemoryPool, HostBackend};
pub use cobalt_sampler::{Sampler, SamplerFactory, SamplingStrategy};
pub use cobalt_scheduler::{MultiNodeScheduler, StatusReport};
pub use cobalt_types::*;
pub use config::Config;

use std::sync::Arc;
use tracing::{info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Registry holding every configured model; unknown ids resolve to the default spec.
pub fn build_registry(config: &Config) -> Result<Arc<StaticModelRegistry>> {
    let registry = StaticModelRegistry::with_fallback(ModelSpec::default());
    for model in &config.models {
        registry.register(model.id.as_str(), model.to_spec())?;
    }
    Ok(Arc::new(registry))
}

/// Build the scheduler, its nodes and the preloaded models described by `config`.
///
/// Background loops are not started; call [`MultiNodeScheduler::start`].
pub fn init_scheduler(config: &Config) -> Result<Arc<MultiNodeScheduler>> {
    config.validate()?;
    let backend: Arc<dyn ComputeBackend> = Arc::new(
        HostBackend::new(config.backend.devices)
            .with_max_streams_per_device(config.backend.max_streams_per_device),
    );
    let registry = build_registry(config)?;
    let scheduler = MultiNodeScheduler::new(config.scheduler.clone(), backend, registry)?
        .with_kv_cache_config(config.kv_cache.clone());

    for node in &config.nodes {
        scheduler.add_compute_node(node.clone())?;
    }
    for model in config.models.iter().filter(|m| m.preload) {
        match scheduler.load_model(model.id.as_str(), model.path.as_deref()) {
            Ok(info) => info!("Preloaded model {} on {}", info.model_id, info.node_id),
            Err(e) if e.is_retryable() => warn!("Skipping preload of {}: {}", model.id, e),
            Err(e) => return Err(e),
        }
    }
    scheduler.refresh_stats();
    Ok(Arc::new(scheduler))
}
