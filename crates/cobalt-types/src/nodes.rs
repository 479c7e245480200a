//! Virtual compute node configuration and status

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{CobaltError, DataType, ModelId, NodeId, Result};

/// Immutable configuration of a virtual compute node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualNodeConfig {
    pub node_id: NodeId,
    /// Accelerator device the node binds to
    pub device_id: u32,
    /// Device memory budget shared by model weights and KV cache
    pub memory_limit_mb: u64,
    /// Admission cap on resident models
    pub max_concurrent_models: usize,
    /// Compute streams, one generation slot each
    pub num_streams: usize,
    /// Largest batch a stream's cache may hold (bounds beam width)
    pub max_batch_size: usize,
    /// Store KV cache in fp16 instead of fp32
    pub use_mixed_precision: bool,
}

impl Default for VirtualNodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("node_0"),
            device_id: 0,
            memory_limit_mb: 8192,
            max_concurrent_models: 4,
            num_streams: 4,
            max_batch_size: 8,
            use_mixed_precision: true,
        }
    }
}

impl VirtualNodeConfig {
    pub fn new(node_id: impl Into<NodeId>, device_id: u32) -> Self {
        Self {
            node_id: node_id.into(),
            device_id,
            ..Default::default()
        }
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_max_concurrent_models(mut self, max: usize) -> Self {
        self.max_concurrent_models = max;
        self
    }

    pub fn with_num_streams(mut self, streams: usize) -> Self {
        self.num_streams = streams;
        self
    }

    /// Element type used for this node's KV cache buffers
    pub fn kv_dtype(&self) -> DataType {
        if self.use_mixed_precision {
            DataType::FP16
        } else {
            DataType::FP32
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.as_str().is_empty() {
            return Err(CobaltError::config("node_id must not be empty"));
        }
        if self.memory_limit_mb == 0 {
            return Err(CobaltError::config(format!(
                "node {}: memory_limit_mb must be positive",
                self.node_id
            )));
        }
        if self.max_concurrent_models == 0 {
            return Err(CobaltError::config(format!(
                "node {}: max_concurrent_models must be positive",
                self.node_id
            )));
        }
        if self.num_streams == 0 || self.max_batch_size == 0 {
            return Err(CobaltError::config(format!(
                "node {}: num_streams and max_batch_size must be positive",
                self.node_id
            )));
        }
        Ok(())
    }
}

/// Lifecycle of a virtual compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Created,
    Initializing,
    Ready,
    Busy,
    ShuttingDown,
    Destroyed,
    Error,
}

impl NodeState {
    /// States in which the node accepts work
    pub fn is_serving(&self) -> bool {
        matches!(self, NodeState::Ready | NodeState::Busy)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Created => "created",
            NodeState::Initializing => "initializing",
            NodeState::Ready => "ready",
            NodeState::Busy => "busy",
            NodeState::ShuttingDown => "shutting_down",
            NodeState::Destroyed => "destroyed",
            NodeState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Point-in-time snapshot of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualNodeStatus {
    pub node_id: NodeId,
    pub device_id: u32,
    pub state: NodeState,
    pub active: bool,
    pub used_memory_mb: f64,
    pub available_memory_mb: f64,
    /// Bytes currently held by the node's KV caches
    pub kv_cache_bytes: u64,
    pub active_models: usize,
    pub max_concurrent_models: usize,
    pub loaded_models: Vec<ModelId>,
    /// Requests waiting for a free stream
    pub queued_requests: usize,
    /// Requests currently generating
    pub in_flight_requests: usize,
    /// Resident models over the concurrency cap, clamped to 1
    pub utilization: f32,
    pub memory_utilization: f32,
    pub total_requests_processed: u64,
    pub failed_requests: u64,
    pub average_processing_time_ms: f64,
}
