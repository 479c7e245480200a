//! Virtual compute node
//!
//! A node owns one device's memory budget, a pool of compute streams (each
//! with its own KV cache manager) and the set of models resident on the
//! device. Requests run synchronously on the calling thread; the async
//! variant moves them to tokio's blocking pool.

use chrono::Utc;
use cobalt_runtime::{ComputeBackend, DeviceMemoryPool, MemoryReservation};
use cobalt_sampler::{SamplerFactory, SamplingStrategy};
use cobalt_types::{
    bytes_to_mb, mb_to_bytes, running_mean, CobaltError, InferenceRequest, InferenceResponse,
    KvCacheConfig, ModelId, ModelInfo, NodeId, NodeState, RequestId, Result, VirtualNodeConfig,
    VirtualNodeStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::detokenizer::{Detokenizer, TokenIdRenderer};
use crate::executor::{GenerationOutcome, TransformerStepExecutor};
use crate::registry::ModelRegistry;
use crate::streams::StreamPool;

/// Memory assumed for a request that does not state its own requirement
pub const DEFAULT_MEMORY_REQUIREMENT_MB: u64 = 512;

#[derive(Debug)]
struct ResidentModel {
    info: ModelInfo,
    _weights: MemoryReservation,
}

#[derive(Debug, Default)]
struct NodeCounters {
    total_requests_processed: u64,
    failed_requests: u64,
    average_processing_time_ms: f64,
}

/// A resource-bounded worker bound to one accelerator device
pub struct VirtualComputeNode {
    config: VirtualNodeConfig,
    backend: Arc<dyn ComputeBackend>,
    registry: Arc<dyn ModelRegistry>,
    detokenizer: Arc<dyn Detokenizer>,
    kv_config: KvCacheConfig,
    memory: DeviceMemoryPool,
    state: RwLock<NodeState>,
    streams: RwLock<Option<Arc<StreamPool>>>,
    models: RwLock<HashMap<ModelId, ResidentModel>>,
    in_flight: Mutex<HashMap<RequestId, Arc<AtomicBool>>>,
    counters: Mutex<NodeCounters>,
}

impl std::fmt::Debug for VirtualComputeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualComputeNode")
            .field("node_id", &self.config.node_id)
            .field("device_id", &self.config.device_id)
            .field("state", &*self.state.read())
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl VirtualComputeNode {
    /// Create a node in the `Created` state. Nothing touches the device until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: VirtualNodeConfig,
        backend: Arc<dyn ComputeBackend>,
        registry: Arc<dyn ModelRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let memory = DeviceMemoryPool::new(config.device_id, mb_to_bytes(config.memory_limit_mb));
        let kv_config = KvCacheConfig {
            max_batch_size: config.max_batch_size,
            dtype: config.kv_dtype(),
            ..Default::default()
        };
        Ok(Self {
            config,
            backend,
            registry,
            detokenizer: Arc::new(TokenIdRenderer),
            kv_config,
            memory,
            state: RwLock::new(NodeState::Created),
            streams: RwLock::new(None),
            models: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            counters: Mutex::new(NodeCounters::default()),
        })
    }

    pub fn with_detokenizer(mut self, detokenizer: Arc<dyn Detokenizer>) -> Self {
        self.detokenizer = detokenizer;
        self
    }

    /// Initial KV cache shape of each stream. Batch limit and element type
    /// always come from the node config.
    pub fn with_kv_cache_config(mut self, kv_config: KvCacheConfig) -> Self {
        self.kv_config = KvCacheConfig {
            max_batch_size: self.config.max_batch_size,
            dtype: self.config.kv_dtype(),
            ..kv_config
        };
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    pub fn config(&self) -> &VirtualNodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn memory_pool(&self) -> &DeviceMemoryPool {
        &self.memory
    }

    /// Bind to the device and create the stream pool.
    ///
    /// `Created → Initializing → Ready`, or `→ Error` when the device is
    /// missing or a stream cannot be created.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Created {
                return Err(CobaltError::invalid_state(format!(
                    "node {} cannot initialize from state {}",
                    self.config.node_id, *state
                )));
            }
            *state = NodeState::Initializing;
        }
        info!(
            "Initializing compute node {} on device {} ({} MB, {} streams)",
            self.config.node_id,
            self.config.device_id,
            self.config.memory_limit_mb,
            self.config.num_streams
        );

        match self.bind_device() {
            Ok(streams) => {
                *self.streams.write() = Some(Arc::new(streams));
                *self.state.write() = NodeState::Ready;
                info!("Compute node {} ready", self.config.node_id);
                Ok(())
            }
            Err(e) => {
                error!("Compute node {} failed to initialize: {}", self.config.node_id, e);
                *self.state.write() = NodeState::Error;
                Err(e)
            }
        }
    }

    fn bind_device(&self) -> Result<StreamPool> {
        let devices = self.backend.device_count();
        if self.config.device_id as usize >= devices {
            return Err(CobaltError::not_found(format!(
                "device {} unavailable on {} backend ({} devices)",
                self.config.device_id,
                self.backend.name(),
                devices
            )));
        }
        StreamPool::create(
            self.backend.clone(),
            self.config.device_id,
            self.config.num_streams,
            &self.kv_config,
            &self.memory,
        )
    }

    fn release_streams(&self) {
        if let Some(streams) = self.streams.write().take() {
            streams.destroy();
        }
    }

    /// Re-initialize a node in the `Error` state. Resident models stay loaded.
    pub fn recover(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != NodeState::Error {
                return Err(CobaltError::invalid_state(format!(
                    "node {} is {}, only failed nodes can recover",
                    self.config.node_id, *state
                )));
            }
            *state = NodeState::Created;
        }
        warn!("Recovering compute node {}", self.config.node_id);
        self.release_streams();
        self.initialize()
    }

    /// Take the node out of service. It stays in `Error` until [`recover`](Self::recover).
    pub fn mark_unhealthy(&self, reason: &str) {
        let mut state = self.state.write();
        if matches!(*state, NodeState::ShuttingDown | NodeState::Destroyed) {
            return;
        }
        error!("Compute node {} marked unhealthy: {}", self.config.node_id, reason);
        *state = NodeState::Error;
    }

    /// Cancel in-flight work, free streams and models, and end in `Destroyed`.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, NodeState::ShuttingDown | NodeState::Destroyed) {
                return;
            }
            *state = NodeState::ShuttingDown;
        }
        info!("Shutting down compute node {}", self.config.node_id);

        let cancelled = {
            let in_flight = self.in_flight.lock();
            for flag in in_flight.values() {
                flag.store(true, Ordering::Release);
            }
            in_flight.len()
        };
        self.release_streams();
        let unloaded = self.models.write().drain().count();

        *self.state.write() = NodeState::Destroyed;
        info!(
            "Compute node {} destroyed ({} requests cancelled, {} models unloaded)",
            self.config.node_id, cancelled, unloaded
        );
    }

    pub fn is_healthy(&self) -> bool {
        self.state.read().is_serving()
    }

    /// Make `model_id` resident, reserving its weight footprint.
    ///
    /// Loading a model that is already resident returns its info unchanged.
    pub fn load_model(&self, model_id: impl Into<ModelId>, path: Option<&str>) -> Result<ModelInfo> {
        let model_id = model_id.into();
        if !self.is_healthy() {
            return Err(CobaltError::invalid_state(format!(
                "node {} is {}, cannot load {}",
                self.config.node_id,
                self.state(),
                model_id
            )));
        }

        let mut models = self.models.write();
        if let Some(resident) = models.get(&model_id) {
            debug!("model {} already loaded on {}", model_id, self.config.node_id);
            return Ok(resident.info.clone());
        }
        if models.len() >= self.config.max_concurrent_models {
            return Err(CobaltError::resource_exhausted(format!(
                "node {} already hosts {} of {} models",
                self.config.node_id,
                models.len(),
                self.config.max_concurrent_models
            )));
        }

        let started = Instant::now();
        let spec = self.registry.resolve(&model_id, path)?;
        spec.validate()?;
        let weights = self
            .memory
            .reserve(mb_to_bytes(spec.memory_mb), format!("weights of {}", model_id))
            .map_err(|e| {
                warn!("Cannot load {} on {}: {}", model_id, self.config.node_id, e);
                e
            })?;

        let now = Utc::now();
        let info = ModelInfo {
            model_id: model_id.clone(),
            node_id: self.config.node_id.clone(),
            spec,
            loading_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            loaded_at: now,
            last_used: now,
            requests_served: 0,
        };
        info!(
            "Loaded model {} on {} ({} MB from {})",
            model_id, self.config.node_id, info.spec.memory_mb, info.spec.path
        );
        models.insert(
            model_id,
            ResidentModel {
                info: info.clone(),
                _weights: weights,
            },
        );
        Ok(info)
    }

    /// Drop a resident model and its memory reservation.
    pub fn unload_model(&self, model_id: &ModelId) -> Result<()> {
        match self.models.write().remove(model_id) {
            Some(_) => {
                info!("Unloaded model {} from {}", model_id, self.config.node_id);
                Ok(())
            }
            None => Err(CobaltError::not_found(format!(
                "model {} is not loaded on {}",
                model_id, self.config.node_id
            ))),
        }
    }

    pub fn has_model(&self, model_id: &ModelId) -> bool {
        self.models.read().contains_key(model_id)
    }

    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self.models.read().values().map(|m| m.info.clone()).collect();
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        infos
    }

    pub fn available_memory_mb(&self) -> f64 {
        bytes_to_mb(self.memory.available_bytes())
    }

    /// Admission check with the default memory floor
    pub fn can_handle_request(&self, request: &InferenceRequest) -> bool {
        self.can_handle_request_with_floor(request, DEFAULT_MEMORY_REQUIREMENT_MB)
    }

    /// True when the node is serving, hosts the request's model within its
    /// model cap, and has at least the request's memory requirement free.
    pub fn can_handle_request_with_floor(&self, request: &InferenceRequest, floor_mb: u64) -> bool {
        if !self.is_healthy() {
            return false;
        }
        {
            let models = self.models.read();
            if !models.contains_key(&request.model_id)
                || models.len() > self.config.max_concurrent_models
            {
                return false;
            }
        }
        self.memory.available_bytes() >= mb_to_bytes(request.memory_requirement_or(floor_mb))
    }

    /// Whether `model_id` is resident or could be loaded with `footprint_mb` of weights
    pub fn can_host_model(&self, model_id: &ModelId, footprint_mb: u64) -> bool {
        if !self.is_healthy() {
            return false;
        }
        let models = self.models.read();
        if models.contains_key(model_id) {
            return true;
        }
        models.len() < self.config.max_concurrent_models
            && self.memory.available_bytes() >= mb_to_bytes(footprint_mb)
    }

    /// Mark an in-flight request cancelled. Generation stops before its next step.
    pub fn cancel_request(&self, request_id: &RequestId) -> bool {
        match self.in_flight.lock().get(request_id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                debug!("cancellation requested for {} on {}", request_id, self.config.node_id);
                true
            }
            None => false,
        }
    }

    fn begin_request(&self, request_id: &RequestId) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut in_flight = self.in_flight.lock();
        in_flight.insert(request_id.clone(), flag.clone());
        let mut state = self.state.write();
        if *state == NodeState::Ready {
            *state = NodeState::Busy;
        }
        flag
    }

    fn end_request(&self, request_id: &RequestId) {
        let mut in_flight = self.in_flight.lock();
        in_flight.remove(request_id);
        if in_flight.is_empty() {
            let mut state = self.state.write();
            if *state == NodeState::Busy {
                *state = NodeState::Ready;
            }
        }
    }

    /// Run one request to completion on this node.
    ///
    /// Every failure, including an unloaded model, comes back as a response
    /// with `success == false`.
    pub fn process_inference(&self, request: &InferenceRequest) -> InferenceResponse {
        let started = Instant::now();
        let mut response = self.run_request(request);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut counters = self.counters.lock();
            counters.total_requests_processed += 1;
            if !response.success {
                counters.failed_requests += 1;
            }
            counters.average_processing_time_ms = running_mean(
                counters.average_processing_time_ms,
                counters.total_requests_processed,
                elapsed_ms,
            );
        }

        response.processing_time_ms = elapsed_ms;
        response.compute_node_id = Some(self.config.node_id.clone());
        response.gpu_utilization = self.utilization();
        response.memory_utilization = self.memory_utilization();
        if response.success {
            debug!(
                "request {} on {}: {} tokens in {:.1} ms",
                request.id, self.config.node_id, response.tokens_generated, elapsed_ms
            );
        } else {
            warn!(
                "request {} on {} failed: {}",
                request.id,
                self.config.node_id,
                response.error_message.as_deref().unwrap_or("unknown error")
            );
        }
        response
    }

    fn run_request(&self, request: &InferenceRequest) -> InferenceResponse {
        if !self.is_healthy() {
            return InferenceResponse::failure(
                request,
                format!("node {} is {}", self.config.node_id, self.state()),
            );
        }
        let spec = match self.models.read().get(&request.model_id) {
            Some(resident) => resident.info.spec.clone(),
            None => {
                return InferenceResponse::failure(
                    request,
                    format!(
                        "model {} is not loaded on node {}",
                        request.model_id, self.config.node_id
                    ),
                )
            }
        };

        let mut sampling = request.effective_sampling();
        if !sampling.stop_tokens.contains(&spec.eos_token) {
            sampling.stop_tokens.push(spec.eos_token);
        }
        let mut sampler = match SamplerFactory::create_sampler(request.strategy, sampling) {
            Ok(sampler) => sampler,
            Err(e) => return InferenceResponse::failure(request, e.to_string()),
        };
        if sampler.strategy() == SamplingStrategy::Beam
            && sampler.config().beam_width > self.config.max_batch_size
        {
            return InferenceResponse::failure(
                request,
                format!(
                    "beam width {} exceeds node batch limit {}",
                    sampler.config().beam_width,
                    self.config.max_batch_size
                ),
            );
        }
        let Some(streams) = self.streams.read().clone() else {
            return InferenceResponse::failure(
                request,
                format!("node {} has no streams", self.config.node_id),
            );
        };

        let cancelled = self.begin_request(&request.id);
        let sequence_length = (request.prompt_tokens.len().max(1) + request.max_tokens)
            .min(spec.max_sequence_length);
        let prepared = streams.acquire().and_then(|mut lease| {
            lease.prepare(&spec, sequence_length, &self.memory)?;
            Ok(lease)
        });
        let outcome = match prepared {
            Ok(lease) => TransformerStepExecutor::new(
                self.backend.as_ref(),
                &lease.cache,
                lease.stream,
                &spec,
            )
            .generate(&request.prompt_tokens, &mut sampler, &cancelled),
            Err(e) => GenerationOutcome {
                tokens: Vec::new(),
                finish_reason: cobalt_types::FinishReason::Error,
                error: Some(e),
                steps: 0,
            },
        };
        self.end_request(&request.id);

        if let Some(resident) = self.models.write().get_mut(&request.model_id) {
            resident.info.last_used = Utc::now();
            resident.info.requests_served += 1;
        }

        let mut response = InferenceResponse::for_request(request);
        response.generated_text = self.detokenizer.decode(&outcome.tokens);
        response.tokens_generated = outcome.tokens.len();
        response.tokens = outcome.tokens;
        response.finish_reason = Some(outcome.finish_reason);
        if let Some(e) = outcome.error {
            response.success = false;
            response.error_message = Some(e.to_string());
        }
        response
    }

    /// Run `request` on tokio's blocking pool.
    pub async fn process_inference_async(self: &Arc<Self>, request: InferenceRequest) -> InferenceResponse {
        let node = Arc::clone(self);
        let job = request.clone();
        match tokio::task::spawn_blocking(move || node.process_inference(&job)).await {
            Ok(response) => response,
            Err(e) => {
                let mut response =
                    InferenceResponse::failure(&request, format!("inference task failed: {}", e));
                response.compute_node_id = Some(self.config.node_id.clone());
                response
            }
        }
    }

    /// Resident models over the model cap, clamped to 1
    pub fn utilization(&self) -> f32 {
        let active = self.models.read().len();
        (active as f32 / self.config.max_concurrent_models as f32).min(1.0)
    }

    pub fn memory_utilization(&self) -> f32 {
        let limit = self.memory.limit_bytes();
        if limit == 0 {
            return 0.0;
        }
        self.memory.used_bytes() as f32 / limit as f32
    }

    /// Point-in-time snapshot. Only takes short-lived locks, never waits on generation.
    pub fn get_status(&self) -> VirtualNodeStatus {
        let state = self.state();
        let (loaded_models, weight_bytes) = {
            let models = self.models.read();
            let mut ids: Vec<ModelId> = models.keys().cloned().collect();
            ids.sort();
            let bytes: u64 = models.values().map(|m| m.info.spec.memory_mb).map(mb_to_bytes).sum();
            (ids, bytes)
        };
        let (queued, running) = match self.streams.read().as_ref() {
            Some(streams) => (streams.waiting(), streams.in_use()),
            None => (0, 0),
        };
        let counters = self.counters.lock();
        let used = self.memory.used_bytes();

        VirtualNodeStatus {
            node_id: self.config.node_id.clone(),
            device_id: self.config.device_id,
            state,
            active: state.is_serving(),
            used_memory_mb: bytes_to_mb(used),
            available_memory_mb: bytes_to_mb(self.memory.available_bytes()),
            kv_cache_bytes: used.saturating_sub(weight_bytes),
            active_models: loaded_models.len(),
            max_concurrent_models: self.config.max_concurrent_models,
            loaded_models,
            queued_requests: queued,
            in_flight_requests: running,
            utilization: self.utilization(),
            memory_utilization: self.memory_utilization(),
            total_requests_processed: counters.total_requests_processed,
            failed_requests: counters.failed_requests,
            average_processing_time_ms: counters.average_processing_time_ms,
        }
    }
}

impl Drop for VirtualComputeNode {
    fn drop(&mut self) {
        self.release_streams();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticModelRegistry;
    use cobalt_runtime::HostBackend;
    use cobalt_types::ModelSpec;

    fn node(max_models: usize) -> VirtualComputeNode {
        let registry = Arc::new(StaticModelRegistry::with_fallback(ModelSpec {
            memory_mb: 1024,
            max_sequence_length: 128,
            ..Default::default()
        }));
        let node = VirtualComputeNode::new(
            VirtualNodeConfig::new("gpu0", 0)
                .with_memory_limit_mb(4096)
                .with_max_concurrent_models(max_models)
                .with_num_streams(2),
            Arc::new(HostBackend::new(1)),
            registry,
        )
        .unwrap();
        node.initialize().unwrap();
        node
    }

    #[test]
    fn lifecycle_transitions() {
        let n = node(2);
        assert_eq!(n.state(), NodeState::Ready);
        assert!(n.initialize().is_err());
        assert!(n.recover().is_err());
        n.shutdown();
        assert_eq!(n.state(), NodeState::Destroyed);
        assert!(!n.is_healthy());
        n.shutdown();
    }

    #[test]
    fn load_is_idempotent_and_reserves_memory() {
        let n = node(2);
        let before = n.memory_pool().used_bytes();
        let info = n.load_model("m1", None).unwrap();
        assert_eq!(info.spec.path, "models/m1");
        assert_eq!(n.memory_pool().used_bytes() - before, mb_to_bytes(1024));
        n.load_model("m1", None).unwrap();
        assert_eq!(n.memory_pool().used_bytes() - before, mb_to_bytes(1024));
        assert_eq!(n.loaded_models().len(), 1);
    }

    #[test]
    fn unload_frees_and_rejects_unknown_models() {
        let n = node(2);
        let before = n.memory_pool().used_bytes();
        n.load_model("m1", None).unwrap();
        n.unload_model(&ModelId::new("m1")).unwrap();
        assert_eq!(n.memory_pool().used_bytes(), before);
        assert!(matches!(
            n.unload_model(&ModelId::new("m1")),
            Err(CobaltError::NotFound { .. })
        ));
    }

    #[test]
    fn memory_budget_limits_loading() {
        let n = node(8);
        for i in 0..4 {
            n.load_model(format!("m{}", i), None).unwrap();
        }
        assert!(matches!(
            n.load_model("m4", None),
            Err(CobaltError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn unloaded_model_fails_without_panicking() {
        let n = node(2);
        let response = n.process_inference(&InferenceRequest::new("ghost", vec![]).with_max_tokens(3));
        assert!(!response.success);
        assert!(response.error_message.unwrap().contains("not loaded"));
        assert_eq!(n.get_status().failed_requests, 1);
    }

    #[test]
    fn missing_device_puts_node_in_error() {
        let n = VirtualComputeNode::new(
            VirtualNodeConfig::new("gpu9", 9),
            Arc::new(HostBackend::new(1)),
            Arc::new(StaticModelRegistry::new()),
        )
        .unwrap();
        assert!(n.initialize().is_err());
        assert_eq!(n.state(), NodeState::Error);
        assert!(!n.is_healthy());
    }

    #[test]
    fn status_reflects_cache_and_models() {
        let n = node(2);
        n.load_model("m1", None).unwrap();
        let response = n.process_inference(&InferenceRequest::new("m1", vec![]).with_max_tokens(4));
        assert!(response.success, "{:?}", response.error_message);

        let status = n.get_status();
        assert_eq!(status.state, NodeState::Ready);
        assert_eq!(status.loaded_models, vec![ModelId::new("m1")]);
        assert_eq!(status.utilization, 0.5);
        assert!(status.kv_cache_bytes > 0);
        assert_eq!(status.total_requests_processed, 1);
        assert_eq!(status.in_flight_requests, 0);
    }
}
