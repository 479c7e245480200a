//! Placement, statistics and background processing

use cobalt_engine::StaticModelRegistry;
use cobalt_runtime::HostBackend;
use cobalt_scheduler::{MultiNodeScheduler, StatusReport};
use cobalt_types::{
    CobaltError, FinishReason, InferenceRequest, ModelId, ModelSpec, NodeId, SchedulerConfig,
    TokenId, VirtualNodeConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn scheduler_with(config: SchedulerConfig, devices: usize) -> MultiNodeScheduler {
    let registry = Arc::new(StaticModelRegistry::with_fallback(ModelSpec {
        memory_mb: 1024,
        max_sequence_length: 256,
        ..Default::default()
    }));
    MultiNodeScheduler::new(config, Arc::new(HostBackend::new(devices)), registry).unwrap()
}

fn scheduler(devices: usize) -> MultiNodeScheduler {
    scheduler_with(SchedulerConfig::default(), devices)
}

fn node(id: &str, device: u32, memory_mb: u64, max_models: usize) -> VirtualNodeConfig {
    VirtualNodeConfig::new(id, device)
        .with_memory_limit_mb(memory_mb)
        .with_max_concurrent_models(max_models)
}

#[test]
fn end_to_end_single_node() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();

    let request = InferenceRequest::new("m1", vec![TokenId(3), TokenId(4)]).with_max_tokens(5);
    let response = scheduler.process_inference(&request);

    assert!(response.success, "{:?}", response.error_message);
    assert!(response.tokens_generated <= 5);
    assert_eq!(response.compute_node_id, Some(NodeId::new("node_0")));
    let stats = scheduler.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
    assert_eq!(stats.per_model[&ModelId::new("m1")].requests, 1);
}

#[test]
fn no_qualifying_node_means_rejection() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 2048, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();

    let greedy = InferenceRequest::new("m1", vec![]).with_memory_requirement_mb(4096);
    assert!(scheduler.select_best_compute_node(&greedy).is_none());
    let unknown = InferenceRequest::new("m2", vec![]);
    assert!(scheduler.select_best_compute_node(&unknown).is_none());

    let response = scheduler.process_inference(&greedy);
    assert!(!response.success);
    assert!(response.compute_node_id.is_none());
    assert_eq!(scheduler.stats().failed_requests, 1);
}

#[test]
fn placement_prefers_free_memory() {
    let scheduler = scheduler(2);
    scheduler.add_compute_node(node("small", 0, 4096, 4)).unwrap();
    scheduler.add_compute_node(node("large", 1, 8192, 4)).unwrap();

    let info = scheduler.load_model("m1", None).unwrap();
    assert_eq!(info.node_id, NodeId::new("large"));
    // already resident: no second copy
    let again = scheduler.load_model("m1", None).unwrap();
    assert_eq!(again.node_id, NodeId::new("large"));
    assert_eq!(scheduler.loaded_models().len(), 1);
}

#[test]
fn ties_go_to_the_first_registered_node() {
    let scheduler = scheduler(2);
    scheduler.add_compute_node(node("a", 0, 8192, 4)).unwrap();
    scheduler.add_compute_node(node("b", 1, 8192, 4)).unwrap();
    for n in ["a", "b"] {
        scheduler.node(&NodeId::new(n)).unwrap().load_model("m1", None).unwrap();
    }
    let request = InferenceRequest::new("m1", vec![]);
    assert_eq!(scheduler.select_best_compute_node(&request), Some(NodeId::new("a")));
    assert_eq!(scheduler.score_candidates(&request).len(), 2);
}

#[test]
fn unload_and_remove() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();
    scheduler.unload_model(&ModelId::new("m1")).unwrap();
    assert!(matches!(
        scheduler.unload_model(&ModelId::new("m1")),
        Err(CobaltError::NotFound { .. })
    ));

    assert!(scheduler.add_compute_node(node("node_0", 0, 8192, 4)).is_err());
    scheduler.remove_compute_node(&NodeId::new("node_0")).unwrap();
    assert!(scheduler.remove_compute_node(&NodeId::new("node_0")).is_err());
    assert!(!scheduler.is_healthy());
}

#[test]
fn nodes_on_missing_devices_are_not_registered() {
    let scheduler = scheduler(1);
    assert!(scheduler.add_compute_node(node("ghost", 3, 8192, 4)).is_err());
    assert_eq!(scheduler.node_count(), 0);
}

#[test]
fn loading_fails_when_nothing_fits() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 512, 4)).unwrap();
    assert!(matches!(
        scheduler.load_model("m1", None),
        Err(CobaltError::ResourceExhausted { .. })
    ));
}

#[test]
fn refresh_aggregates_node_snapshots() {
    let scheduler = scheduler(2);
    scheduler.add_compute_node(node("a", 0, 8192, 4)).unwrap();
    scheduler.add_compute_node(node("b", 1, 8192, 2)).unwrap();
    scheduler.load_model("m1", None).unwrap();
    scheduler.refresh_stats();

    let stats = scheduler.stats();
    assert_eq!(stats.active_compute_nodes, 2);
    assert_eq!(stats.active_models, 1);
    assert!(stats.total_memory_usage_mb >= 1024.0);
    assert!(stats.last_refresh.is_some());
}

#[tokio::test]
async fn async_processing_records_stats() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();
    let response = scheduler
        .process_inference_async(InferenceRequest::new("m1", vec![]).with_max_tokens(3))
        .await;
    assert!(response.success);
    assert_eq!(scheduler.stats().total_requests, 1);
}

#[tokio::test]
async fn submitted_requests_flow_through_the_balancer() {
    let scheduler = Arc::new(scheduler_with(
        SchedulerConfig {
            stats_interval_ms: 10,
            ..Default::default()
        },
        1,
    ));
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();
    scheduler.start().unwrap();
    assert!(scheduler.start().is_err());

    let receivers: Vec<_> = (0..4)
        .map(|_| {
            scheduler
                .submit(InferenceRequest::new("m1", vec![TokenId(5)]).with_max_tokens(3))
                .unwrap()
        })
        .collect();
    let rejected = scheduler
        .submit(InferenceRequest::new("nope", vec![]))
        .unwrap();

    for rx in receivers {
        let response = rx.await.unwrap();
        assert!(response.success, "{:?}", response.error_message);
        assert!(response.queue_position.is_some());
    }
    assert!(!rejected.await.unwrap().success);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = scheduler.stats();
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.failed_requests, 1);
    assert!(stats.last_refresh.is_some());

    scheduler.shutdown().await;
    assert!(!scheduler.is_running());
    assert!(scheduler
        .submit(InferenceRequest::new("m1", vec![]))
        .is_err());
}

#[tokio::test]
async fn queued_requests_can_be_cancelled() {
    let scheduler = Arc::new(scheduler(1));
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();

    // not started yet, so the request stays queued
    let request = InferenceRequest::new("m1", vec![]).with_max_tokens(3);
    let id = request.id.clone();
    let rx = scheduler.submit(request).unwrap();
    assert!(scheduler.cancel(&id));
    scheduler.refresh_stats();
    assert_eq!(scheduler.status_report().stats.queued_requests, 1);

    scheduler.start().unwrap();
    let response = rx.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.finish_reason, Some(FinishReason::Cancelled));
    scheduler.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_requests_never_dispatched() {
    let scheduler = Arc::new(scheduler(1));
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    let rx = scheduler.submit(InferenceRequest::new("m1", vec![])).unwrap();
    scheduler.shutdown().await;
    let response = rx.await.unwrap();
    assert!(!response.success);
    assert_eq!(scheduler.node_count(), 0);
}

#[test]
fn status_report_serializes() {
    let scheduler = scheduler(1);
    scheduler.add_compute_node(node("node_0", 0, 8192, 4)).unwrap();
    scheduler.load_model("m1", None).unwrap();
    scheduler.refresh_stats();

    let report = scheduler.status_report();
    assert!(report.healthy);
    assert!(!report.running);
    let json = serde_json::to_string(&report).unwrap();
    let back: StatusReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.nodes.len(), 1);
    assert_eq!(back.models[0].model_id, ModelId::new("m1"));
}
