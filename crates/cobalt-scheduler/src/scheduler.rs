//! Multi-node scheduler

use chrono::Utc;
use cobalt_engine::{ModelRegistry, VirtualComputeNode};
use cobalt_runtime::ComputeBackend;
use cobalt_types::{
    CobaltError, EngineStats, FinishReason, InferenceRequest, InferenceResponse, KvCacheConfig,
    ModelId, ModelInfo, NodeId, RequestId, Result, SchedulerConfig, VirtualNodeConfig,
    VirtualNodeStatus,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{PendingRequest, RequestQueue};
use crate::report::StatusReport;
use crate::scoring::{best_score, score_node, NodeScore};

/// Owns the compute nodes, places requests on them and aggregates statistics.
///
/// The node registry and the statistics sit behind separate locks, and node
/// work never runs while either is held.
pub struct MultiNodeScheduler {
    config: SchedulerConfig,
    backend: Arc<dyn ComputeBackend>,
    registry: Arc<dyn ModelRegistry>,
    kv_cache: Option<KvCacheConfig>,
    nodes: RwLock<Vec<Arc<VirtualComputeNode>>>,
    stats: Mutex<EngineStats>,
    pub(crate) queue: RequestQueue,
    running: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MultiNodeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiNodeScheduler")
            .field("nodes", &self.nodes.read().len())
            .field("queued", &self.queue.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl MultiNodeScheduler {
    pub fn new(
        config: SchedulerConfig,
        backend: Arc<dyn ComputeBackend>,
        registry: Arc<dyn ModelRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            queue: RequestQueue::new(config.queue_capacity),
            config,
            backend,
            registry,
            kv_cache: None,
            nodes: RwLock::new(Vec::new()),
            stats: Mutex::new(EngineStats::default()),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Initial KV cache shape for nodes created by [`add_compute_node`](Self::add_compute_node)
    pub fn with_kv_cache_config(mut self, kv_cache: KvCacheConfig) -> Self {
        self.kv_cache = Some(kv_cache);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::AcqRel)
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub(crate) fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock())
    }

    /// Create, initialize and register a node on the shared backend.
    pub fn add_compute_node(&self, config: VirtualNodeConfig) -> Result<NodeId> {
        let mut node = VirtualComputeNode::new(config, self.backend.clone(), self.registry.clone())?;
        if let Some(kv) = &self.kv_cache {
            node = node.with_kv_cache_config(kv.clone());
        }
        node.initialize()?;
        self.add_node(Arc::new(node))
    }

    /// Register an already built node. Ids must be unique.
    pub fn add_node(&self, node: Arc<VirtualComputeNode>) -> Result<NodeId> {
        let node_id = node.node_id().clone();
        let mut nodes = self.nodes.write();
        if nodes.iter().any(|n| n.node_id() == &node_id) {
            return Err(CobaltError::invalid_parameter(format!(
                "compute node {} already registered",
                node_id
            )));
        }
        info!(
            "Registered compute node {} (device {}, {} MB)",
            node_id,
            node.config().device_id,
            node.config().memory_limit_mb
        );
        nodes.push(node);
        Ok(node_id)
    }

    /// Unregister and shut down a node. Its in-flight requests are cancelled.
    pub fn remove_compute_node(&self, node_id: &NodeId) -> Result<()> {
        let node = {
            let mut nodes = self.nodes.write();
            let index = nodes
                .iter()
                .position(|n| n.node_id() == node_id)
                .ok_or_else(|| CobaltError::not_found(format!("compute node {} not found", node_id)))?;
            nodes.remove(index)
        };
        node.shutdown();
        info!("Removed compute node {}", node_id);
        Ok(())
    }

    pub fn node(&self, node_id: &NodeId) -> Option<Arc<VirtualComputeNode>> {
        self.nodes.read().iter().find(|n| n.node_id() == node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    fn snapshot(&self) -> Vec<Arc<VirtualComputeNode>> {
        self.nodes.read().clone()
    }

    /// Scores of every node able to take `request`, in registry order
    pub fn score_candidates(&self, request: &InferenceRequest) -> Vec<NodeScore> {
        let floor = self.config.default_memory_requirement_mb;
        self.snapshot()
            .iter()
            .filter(|n| n.can_handle_request_with_floor(request, floor))
            .map(|n| score_node(&n.get_status(), &request.model_id, &self.config))
            .collect()
    }

    /// Best node for `request`, or `None` when no node qualifies.
    pub fn select_best_compute_node(&self, request: &InferenceRequest) -> Option<NodeId> {
        let best = best_score(self.score_candidates(request));
        match &best {
            Some(score) => debug!(
                "request {} -> {} (score {:.3})",
                request.id, score.node_id, score.total
            ),
            None => debug!("no compute node can take request {}", request.id),
        }
        best.map(|s| s.node_id)
    }

    pub(crate) fn select_node(&self, request: &InferenceRequest) -> Option<Arc<VirtualComputeNode>> {
        self.select_best_compute_node(request)
            .and_then(|id| self.node(&id))
    }

    /// Load `model_id` on the best-fitting node, or report where it already lives.
    pub fn load_model(&self, model_id: impl Into<ModelId>, path: Option<&str>) -> Result<ModelInfo> {
        let model_id = model_id.into();
        let nodes = self.snapshot();
        if let Some(info) = nodes
            .iter()
            .find_map(|n| n.loaded_models().into_iter().find(|m| m.model_id == model_id))
        {
            debug!("model {} already resident on {}", model_id, info.node_id);
            return Ok(info);
        }

        let footprint = self.registry.resolve(&model_id, path)?.memory_mb;
        let best = best_score(
            nodes
                .iter()
                .filter(|n| n.can_host_model(&model_id, footprint))
                .map(|n| score_node(&n.get_status(), &model_id, &self.config)),
        )
        .ok_or_else(|| {
            warn!("No compute node can host {} ({} MB)", model_id, footprint);
            CobaltError::resource_exhausted(format!(
                "no compute node can host model {} ({} MB)",
                model_id, footprint
            ))
        })?;

        let node = self
            .node(&best.node_id)
            .ok_or_else(|| CobaltError::not_found(format!("compute node {} vanished", best.node_id)))?;
        node.load_model(model_id, path)
    }

    /// Unload `model_id` from every node that holds it.
    pub fn unload_model(&self, model_id: &ModelId) -> Result<()> {
        let mut unloaded = 0;
        for node in self.snapshot() {
            if node.has_model(model_id) && node.unload_model(model_id).is_ok() {
                unloaded += 1;
            }
        }
        if unloaded == 0 {
            return Err(CobaltError::not_found(format!(
                "model {} is not loaded on any compute node",
                model_id
            )));
        }
        Ok(())
    }

    fn rejection(&self, request: &InferenceRequest) -> InferenceResponse {
        warn!(
            "Rejecting request {}: no compute node can serve model {}",
            request.id, request.model_id
        );
        InferenceResponse::failure(
            request,
            format!("no compute node can serve model {}", request.model_id),
        )
    }

    pub(crate) fn record(&self, response: &InferenceResponse) {
        self.stats.lock().record_completion(
            &response.model_id,
            response.success,
            response.processing_time_ms,
        );
    }

    pub(crate) fn record_wait(&self, wait_ms: f64) {
        self.stats.lock().record_wait(wait_ms);
    }

    /// Place `request` and run it on the calling thread.
    pub fn process_inference(&self, request: &InferenceRequest) -> InferenceResponse {
        let response = match self.select_node(request) {
            Some(node) => node.process_inference(request),
            None => self.rejection(request),
        };
        self.record(&response);
        response
    }

    /// Place `request` and run it on the blocking pool.
    pub async fn process_inference_async(&self, request: InferenceRequest) -> InferenceResponse {
        let response = match self.select_node(&request) {
            Some(node) => node.process_inference_async(request).await,
            None => self.rejection(&request),
        };
        self.record(&response);
        response
    }

    /// Queue `request` for the load balancer; the answer arrives on the receiver.
    pub fn submit(&self, request: InferenceRequest) -> Result<oneshot::Receiver<InferenceResponse>> {
        if *self.shutdown_tx.borrow() {
            return Err(CobaltError::invalid_state("scheduler is shut down"));
        }
        debug!("queued request {} for model {}", request.id, request.model_id);
        self.queue.push(request)
    }

    /// Handle one dequeued request without waiting for it to finish.
    pub(crate) fn dispatch(self: &Arc<Self>, pending: PendingRequest) {
        let wait_ms = pending.enqueued_at.elapsed().as_secs_f64() * 1000.0;
        if !self.queue.mark_dequeued(&pending.request.id) {
            debug!("request {} cancelled while queued", pending.request.id);
            let mut response = InferenceResponse::failure(&pending.request, "cancelled while queued");
            response.finish_reason = Some(FinishReason::Cancelled);
            self.record(&response);
            pending.respond(response);
            return;
        }
        self.record_wait(wait_ms);

        let Some(node) = self.select_node(&pending.request) else {
            let response = self.rejection(&pending.request);
            self.record(&response);
            pending.respond(response);
            return;
        };
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let response = node.process_inference_async(pending.request.clone()).await;
            scheduler.record(&response);
            pending.respond(response);
        });
    }

    /// Cancel a queued or running request.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        if self.queue.cancel(request_id) {
            return true;
        }
        self.snapshot().iter().any(|n| n.cancel_request(request_id))
    }

    pub fn compute_node_status(&self) -> Vec<VirtualNodeStatus> {
        self.snapshot().iter().map(|n| n.get_status()).collect()
    }

    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        self.snapshot()
            .iter()
            .flat_map(|n| n.loaded_models())
            .collect()
    }

    /// At least one node is accepting work
    pub fn is_healthy(&self) -> bool {
        self.snapshot().iter().any(|n| n.is_healthy())
    }

    /// Rebuild the node-derived statistics.
    pub fn refresh_stats(&self) {
        let statuses = self.compute_node_status();
        let queued = self.queue.len();
        self.stats.lock().refresh_from_nodes(&statuses, queued);
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            healthy: self.is_healthy(),
            running: self.is_running(),
            queue_capacity: self.queue.capacity(),
            nodes: self.compute_node_status(),
            models: self.loaded_models(),
            stats: self.stats(),
            generated_at: Utc::now(),
        }
    }

    /// Shut down every node; used once the background loops have stopped.
    pub(crate) fn shutdown_nodes(&self) {
        let nodes = std::mem::take(&mut *self.nodes.write());
        for node in &nodes {
            node.shutdown();
        }
        info!("Shut down {} compute nodes", nodes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_engine::StaticModelRegistry;
    use cobalt_runtime::HostBackend;

    #[test]
    fn concurrent_waits_fold_into_an_exact_mean() {
        let scheduler = Arc::new(
            MultiNodeScheduler::new(
                SchedulerConfig::default(),
                Arc::new(HostBackend::new(1)),
                Arc::new(StaticModelRegistry::new()),
            )
            .unwrap(),
        );
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || {
                    for wait in 0..100 {
                        scheduler.record_wait(wait as f64);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = scheduler.stats();
        assert_eq!(stats.wait_samples, 800);
        assert!((stats.average_wait_time_ms - 49.5).abs() < 1e-6);
    }
}
