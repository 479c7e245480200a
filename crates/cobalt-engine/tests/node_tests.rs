//! Virtual compute node behaviour against the host backend

use cobalt_engine::{StaticModelRegistry, VirtualComputeNode};
use cobalt_runtime::{ComputeBackend, ComputeOp, HostBackend};
use cobalt_types::{
    CobaltError, FinishReason, InferenceRequest, ModelId, ModelSpec, NodeState, Result,
    SamplingConfig, SamplingStrategyKind, StreamId, TokenId, VirtualNodeConfig,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Host backend whose logits op fails or turns to NaN after a number of
/// successes, and can be slowed down per step.
struct FlakyBackend {
    inner: HostBackend,
    logits_budget: Option<usize>,
    nan_after: Option<usize>,
    logits_calls: AtomicUsize,
    step_delay: Duration,
}

impl FlakyBackend {
    fn failing_after(logits_ok: usize) -> Self {
        Self {
            inner: HostBackend::new(1),
            logits_budget: Some(logits_ok),
            nan_after: None,
            logits_calls: AtomicUsize::new(0),
            step_delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            inner: HostBackend::new(1),
            logits_budget: None,
            nan_after: None,
            logits_calls: AtomicUsize::new(0),
            step_delay: delay,
        }
    }

    fn nan_after(logits_ok: usize) -> Self {
        Self {
            inner: HostBackend::new(1),
            logits_budget: None,
            nan_after: Some(logits_ok),
            logits_calls: AtomicUsize::new(0),
            step_delay: Duration::ZERO,
        }
    }
}

impl ComputeBackend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn create_stream(&self, device_id: u32) -> Result<StreamId> {
        self.inner.create_stream(device_id)
    }

    fn destroy_stream(&self, device_id: u32, stream: StreamId) -> Result<()> {
        self.inner.destroy_stream(device_id, stream)
    }

    fn execute(&self, op: ComputeOp<'_>, stream: StreamId) -> Result<()> {
        match op {
            ComputeOp::Logits { hidden, logits } => {
                let calls = self.logits_calls.fetch_add(1, Ordering::SeqCst);
                if self.logits_budget.is_some_and(|budget| calls >= budget) {
                    return Err(CobaltError::execution("device fault in logits"));
                }
                std::thread::sleep(self.step_delay);
                self.inner.execute(
                    ComputeOp::Logits {
                        hidden,
                        logits: &mut *logits,
                    },
                    stream,
                )?;
                if self.nan_after.is_some_and(|ok| calls >= ok) {
                    logits.fill(f32::NAN);
                }
                Ok(())
            }
            op => self.inner.execute(op, stream),
        }
    }
}

fn registry() -> Arc<StaticModelRegistry> {
    Arc::new(StaticModelRegistry::with_fallback(ModelSpec {
        memory_mb: 1024,
        max_sequence_length: 512,
        ..Default::default()
    }))
}

fn ready_node(config: VirtualNodeConfig, backend: Arc<dyn ComputeBackend>) -> Arc<VirtualComputeNode> {
    let node = VirtualComputeNode::new(config, backend, registry()).unwrap();
    node.initialize().unwrap();
    Arc::new(node)
}

fn host_node(max_models: usize) -> Arc<VirtualComputeNode> {
    ready_node(
        VirtualNodeConfig::new("gpu0", 0)
            .with_memory_limit_mb(8192)
            .with_max_concurrent_models(max_models),
        Arc::new(HostBackend::new(1)),
    )
}

/// Request that cannot stop before `n` tokens
fn fixed_length(model: &str, n: usize) -> InferenceRequest {
    InferenceRequest::new(model, vec![TokenId(3), TokenId(4)])
        .with_max_tokens(n)
        .with_sampling(SamplingConfig {
            min_tokens: n,
            ..Default::default()
        })
}

#[test]
fn admission_respects_the_model_cap() {
    let node = host_node(1);
    node.load_model("m1", None).unwrap();

    assert!(node.can_handle_request(&InferenceRequest::new("m1", vec![])));
    assert!(!node.can_handle_request(&InferenceRequest::new("m2", vec![])));
    assert!(!node.can_host_model(&ModelId::new("m2"), 1024));
    assert!(matches!(
        node.load_model("m2", None),
        Err(CobaltError::ResourceExhausted { .. })
    ));
}

#[test]
fn admission_respects_memory_requirements() {
    let node = host_node(4);
    node.load_model("m1", None).unwrap();
    let small = InferenceRequest::new("m1", vec![]).with_memory_requirement_mb(1024);
    let huge = InferenceRequest::new("m1", vec![]).with_memory_requirement_mb(8000);
    assert!(node.can_handle_request(&small));
    assert!(!node.can_handle_request(&huge));
}

#[test]
fn generation_stops_at_max_tokens() {
    let node = host_node(4);
    node.load_model("m1", None).unwrap();

    let response = node.process_inference(&fixed_length("m1", 5));
    assert!(response.success, "{:?}", response.error_message);
    assert_eq!(response.tokens_generated, 5);
    assert_eq!(response.tokens.len(), 5);
    assert_eq!(response.finish_reason, Some(FinishReason::Length));
    assert_eq!(response.compute_node_id.unwrap().as_str(), "gpu0");
    assert_eq!(response.generated_text.split(' ').count(), 5);
    assert_eq!(node.loaded_models()[0].requests_served, 1);
}

#[test]
fn every_strategy_completes() {
    let node = host_node(4);
    node.load_model("m1", None).unwrap();
    for kind in [
        SamplingStrategyKind::Greedy,
        SamplingStrategyKind::Temperature,
        SamplingStrategyKind::TopK,
        SamplingStrategyKind::TopP,
        SamplingStrategyKind::Beam,
    ] {
        let request = InferenceRequest::new("m1", vec![TokenId(5)])
            .with_max_tokens(4)
            .with_strategy(kind)
            .with_sampling(SamplingConfig {
                top_k: 5,
                top_p: 0.9,
                beam_width: 2,
                seed: Some(11),
                ..Default::default()
            });
        let response = node.process_inference(&request);
        assert!(response.success, "{}: {:?}", kind, response.error_message);
        assert!(response.tokens_generated >= 1 && response.tokens_generated <= 4);
    }
    assert_eq!(node.get_status().total_requests_processed, 5);
}

#[test]
fn execution_failure_keeps_partial_tokens() {
    // prefill uses one logits call, each further token one more
    let node = ready_node(
        VirtualNodeConfig::new("gpu0", 0),
        Arc::new(FlakyBackend::failing_after(3)),
    );
    node.load_model("m1", None).unwrap();

    let request = InferenceRequest::new("m1", vec![TokenId(3)])
        .with_max_tokens(10)
        .with_sampling(SamplingConfig {
            min_tokens: 10,
            ..Default::default()
        });
    let response = node.process_inference(&request);
    assert!(!response.success);
    assert_eq!(response.tokens_generated, 3);
    assert_eq!(response.finish_reason, Some(FinishReason::Error));
    assert!(response.error_message.unwrap().contains("device fault"));

    let status = node.get_status();
    assert_eq!(status.failed_requests, 1);
    assert_eq!(status.state, NodeState::Ready);
}

#[test]
fn nan_logits_fail_the_request_only() {
    let node = ready_node(
        VirtualNodeConfig::new("gpu0", 0),
        Arc::new(FlakyBackend::nan_after(3)),
    );
    node.load_model("m1", None).unwrap();

    let response = node.process_inference(&fixed_length("m1", 10));
    assert!(!response.success);
    assert_eq!(response.tokens_generated, 3);
    assert_eq!(response.finish_reason, Some(FinishReason::Error));
    assert!(response.error_message.unwrap().contains("NaN"));

    for kind in [SamplingStrategyKind::TopK, SamplingStrategyKind::Beam] {
        let request = fixed_length("m1", 10)
            .with_strategy(kind)
            .with_sampling(SamplingConfig {
                top_k: 10,
                beam_width: 2,
                min_tokens: 10,
                ..Default::default()
            });
        let response = node.process_inference(&request);
        assert!(!response.success, "{}", kind);
        assert_eq!(response.finish_reason, Some(FinishReason::Error));
    }

    let status = node.get_status();
    assert_eq!(status.failed_requests, 3);
    assert_eq!(status.state, NodeState::Ready);
}

#[tokio::test]
async fn nan_logits_on_the_async_path_come_back_as_failures() {
    let node = ready_node(
        VirtualNodeConfig::new("gpu0", 0),
        Arc::new(FlakyBackend::nan_after(0)),
    );
    node.load_model("m1", None).unwrap();
    let response = node.process_inference_async(fixed_length("m1", 4)).await;
    assert!(!response.success);
    assert_eq!(response.tokens_generated, 0);
    assert!(response.error_message.unwrap().contains("NaN"));
}

#[test]
fn running_requests_can_be_cancelled() {
    let node = ready_node(
        VirtualNodeConfig::new("gpu0", 0),
        Arc::new(FlakyBackend::slow(Duration::from_millis(5))),
    );
    node.load_model("m1", None).unwrap();
    let request = fixed_length("m1", 400);
    let id = request.id.clone();

    let worker = {
        let node = node.clone();
        std::thread::spawn(move || node.process_inference(&request))
    };
    while node.get_status().in_flight_requests == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(node.state(), NodeState::Busy);
    assert!(node.cancel_request(&id));

    let response = worker.join().unwrap();
    assert!(!response.success);
    assert_eq!(response.finish_reason, Some(FinishReason::Cancelled));
    assert!(response.tokens_generated < 400);
    assert!(!node.cancel_request(&id));
    assert_eq!(node.state(), NodeState::Ready);
}

#[test]
fn concurrent_requests_are_all_counted() {
    let node = host_node(4);
    node.load_model("m1", None).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let node = node.clone();
            std::thread::spawn(move || node.process_inference(&fixed_length("m1", 3)))
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap().success);
    }

    let status = node.get_status();
    assert_eq!(status.total_requests_processed, 8);
    assert_eq!(status.failed_requests, 0);
    assert!(status.average_processing_time_ms > 0.0);
}

#[test]
fn recovery_after_failure() {
    let node = host_node(2);
    node.load_model("m1", None).unwrap();
    node.mark_unhealthy("test fault");
    assert_eq!(node.state(), NodeState::Error);
    assert!(!node.can_handle_request(&InferenceRequest::new("m1", vec![])));
    assert!(!node.process_inference(&fixed_length("m1", 2)).success);

    node.recover().unwrap();
    assert_eq!(node.state(), NodeState::Ready);
    assert!(node.process_inference(&fixed_length("m1", 2)).success);
}

#[test]
fn shutdown_unloads_everything() {
    let node = host_node(2);
    node.load_model("m1", None).unwrap();
    node.shutdown();
    assert!(node.loaded_models().is_empty());
    assert_eq!(node.memory_pool().used_bytes(), 0);
    assert!(node.load_model("m1", None).is_err());
}

#[tokio::test]
async fn async_inference_runs_off_the_runtime() {
    let node = host_node(2);
    node.load_model("m1", None).unwrap();
    let response = node.process_inference_async(fixed_length("m1", 3)).await;
    assert!(response.success);
    assert_eq!(response.tokens_generated, 3);
}
