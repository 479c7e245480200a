//! Serializable status document

use chrono::{DateTime, Utc};
use cobalt_types::{EngineStats, ModelInfo, VirtualNodeStatus};
use serde::{Deserialize, Serialize};

/// Snapshot of the whole scheduler for admin and metrics consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub healthy: bool,
    pub running: bool,
    pub queue_capacity: usize,
    pub nodes: Vec<VirtualNodeStatus>,
    pub models: Vec<ModelInfo>,
    pub stats: EngineStats,
    pub generated_at: DateTime<Utc>,
}
