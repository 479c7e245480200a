//! Process-wide statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ModelId, VirtualNodeStatus};

/// Per-model request counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    pub requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Running mean over every completed request for the model
    pub average_latency_ms: f64,
}

/// Aggregate statistics owned by the scheduler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Depth of the global pending queue
    pub queued_requests: usize,
    pub average_latency_ms: f64,
    pub average_wait_time_ms: f64,
    /// Queue waits folded into `average_wait_time_ms`
    #[serde(default)]
    pub wait_samples: u64,
    pub total_memory_usage_mb: f64,
    pub active_models: usize,
    pub active_compute_nodes: usize,
    /// Mean of per-node utilization over active nodes
    pub overall_utilization: f32,
    /// Mean of per-node memory utilization over active nodes
    pub overall_memory_utilization: f32,
    pub per_model: BTreeMap<ModelId, ModelStats>,
    pub last_refresh: Option<DateTime<Utc>>,
}

/// Incremental mean: folds the `count`-th sample into `mean`.
pub fn running_mean(mean: f64, count: u64, sample: f64) -> f64 {
    if count == 0 {
        return sample;
    }
    mean + (sample - mean) / count as f64
}

impl EngineStats {
    /// Fold one completed request into the counters.
    pub fn record_completion(&mut self, model_id: &ModelId, success: bool, latency_ms: f64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.average_latency_ms =
            running_mean(self.average_latency_ms, self.total_requests, latency_ms);

        let model = self.per_model.entry(model_id.clone()).or_default();
        model.requests += 1;
        if success {
            model.successful_requests += 1;
        } else {
            model.failed_requests += 1;
        }
        model.average_latency_ms = running_mean(model.average_latency_ms, model.requests, latency_ms);
    }

    /// Fold one queue wait into the wait-time mean.
    pub fn record_wait(&mut self, wait_ms: f64) {
        self.wait_samples += 1;
        self.average_wait_time_ms =
            running_mean(self.average_wait_time_ms, self.wait_samples, wait_ms);
    }

    /// Rebuild the resource-derived fields from node snapshots.
    pub fn refresh_from_nodes(&mut self, statuses: &[VirtualNodeStatus], queued_requests: usize) {
        let active: Vec<&VirtualNodeStatus> = statuses.iter().filter(|s| s.active).collect();

        self.queued_requests = queued_requests;
        self.active_compute_nodes = active.len();
        self.active_models = active.iter().map(|s| s.active_models).sum();
        self.total_memory_usage_mb = active.iter().map(|s| s.used_memory_mb).sum();

        if active.is_empty() {
            self.overall_utilization = 0.0;
            self.overall_memory_utilization = 0.0;
        } else {
            let n = active.len() as f32;
            self.overall_utilization = active.iter().map(|s| s.utilization).sum::<f32>() / n;
            self.overall_memory_utilization =
                active.iter().map(|s| s.memory_utilization).sum::<f32>() / n;
        }
        self.last_refresh = Some(Utc::now());
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }
}
