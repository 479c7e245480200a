//! Node scoring for placement decisions

use cobalt_types::{ModelId, NodeId, SchedulerConfig, VirtualNodeStatus};
use serde::{Deserialize, Serialize};

/// Affinity of a node that already hosts the request's model
pub const RESIDENT_AFFINITY: f64 = 1.0;
/// Affinity of any other node. Placeholder until a real affinity signal exists.
pub const DEFAULT_AFFINITY: f64 = 0.5;

/// Weighted score of one candidate node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Available memory over the reference capacity, clamped to [0, 1]
    pub memory_score: f64,
    /// One minus utilization
    pub load_score: f64,
    pub affinity_score: f64,
    pub total: f64,
}

/// Score `status` for work on `model_id`.
pub fn score_node(status: &VirtualNodeStatus, model_id: &ModelId, config: &SchedulerConfig) -> NodeScore {
    let memory_score =
        (status.available_memory_mb / config.reference_memory_mb as f64).clamp(0.0, 1.0);
    let load_score = (1.0 - status.utilization as f64).clamp(0.0, 1.0);
    let affinity_score = if status.loaded_models.contains(model_id) {
        RESIDENT_AFFINITY
    } else {
        DEFAULT_AFFINITY
    };
    let w = &config.weights;
    NodeScore {
        node_id: status.node_id.clone(),
        memory_score,
        load_score,
        affinity_score,
        total: memory_score * w.memory + load_score * w.load + affinity_score * w.affinity,
    }
}

/// Highest-scoring entry; the earliest wins ties.
pub fn best_score(scores: impl IntoIterator<Item = NodeScore>) -> Option<NodeScore> {
    scores.into_iter().fold(None, |best, candidate| match best {
        Some(b) if b.total >= candidate.total => Some(b),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_types::NodeState;

    fn status(id: &str, available_mb: f64, utilization: f32, models: &[&str]) -> VirtualNodeStatus {
        VirtualNodeStatus {
            node_id: NodeId::new(id),
            device_id: 0,
            state: NodeState::Ready,
            active: true,
            used_memory_mb: 8192.0 - available_mb,
            available_memory_mb: available_mb,
            kv_cache_bytes: 0,
            active_models: models.len(),
            max_concurrent_models: 4,
            loaded_models: models.iter().map(|m| ModelId::new(*m)).collect(),
            queued_requests: 0,
            in_flight_requests: 0,
            utilization,
            memory_utilization: 0.0,
            total_requests_processed: 0,
            failed_requests: 0,
            average_processing_time_ms: 0.0,
        }
    }

    #[test]
    fn weights_combine_the_three_factors() {
        let config = SchedulerConfig::default();
        let score = score_node(&status("a", 4096.0, 0.25, &["m1"]), &ModelId::new("m1"), &config);
        assert!((score.memory_score - 0.5).abs() < 1e-9);
        assert!((score.load_score - 0.75).abs() < 1e-9);
        assert_eq!(score.affinity_score, RESIDENT_AFFINITY);
        assert!((score.total - (0.5 * 0.4 + 0.75 * 0.4 + 1.0 * 0.2)).abs() < 1e-9);
    }

    #[test]
    fn memory_score_is_clamped() {
        let config = SchedulerConfig::default();
        let score = score_node(&status("a", 65536.0, 0.0, &[]), &ModelId::new("m1"), &config);
        assert_eq!(score.memory_score, 1.0);
        assert_eq!(score.affinity_score, DEFAULT_AFFINITY);
    }

    #[test]
    fn ties_go_to_the_first_node() {
        let config = SchedulerConfig::default();
        let model = ModelId::new("m1");
        let scores = ["a", "b", "c"]
            .iter()
            .map(|id| score_node(&status(id, 2048.0, 0.5, &["m1"]), &model, &config));
        assert_eq!(best_score(scores).unwrap().node_id, NodeId::new("a"));
        assert!(best_score(Vec::new()).is_none());
    }

    #[test]
    fn less_loaded_node_wins() {
        let config = SchedulerConfig::default();
        let model = ModelId::new("m1");
        let scores = vec![
            score_node(&status("busy", 4096.0, 1.0, &["m1"]), &model, &config),
            score_node(&status("idle", 4096.0, 0.25, &["m1"]), &model, &config),
        ];
        assert_eq!(best_score(scores).unwrap().node_id, NodeId::new("idle"));
    }
}
