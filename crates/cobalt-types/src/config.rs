//! Cache and scheduler configuration

use serde::{Deserialize, Serialize};

use crate::{CobaltError, DataType, Result};

/// Shape and limits of a KV cache manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    pub max_batch_size: usize,
    pub max_sequence_length: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub num_layers: usize,
    pub dtype: DataType,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_sequence_length: 2048,
            num_heads: 2,
            head_dim: 8,
            num_layers: 2,
            dtype: DataType::FP16,
        }
    }
}

impl KvCacheConfig {
    /// Elements in one token position of one batch row
    pub fn token_elements(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Bytes for one layer's key plus value buffers at the given shape
    pub fn layer_bytes(&self, batch_size: usize, sequence_length: usize) -> u64 {
        (batch_size * sequence_length * self.token_elements() * self.dtype.size_bytes() * 2) as u64
    }

    /// Whole-model footprint at the given shape
    pub fn model_bytes(&self, batch_size: usize, sequence_length: usize) -> u64 {
        self.layer_bytes(batch_size, sequence_length) * self.num_layers as u64
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_batch_size", self.max_batch_size),
            ("max_sequence_length", self.max_sequence_length),
            ("num_heads", self.num_heads),
            ("head_dim", self.head_dim),
            ("num_layers", self.num_layers),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(CobaltError::config(format!(
                    "KV cache {} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Node-scoring weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub memory: f64,
    pub load: f64,
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            memory: 0.4,
            load: 0.4,
            affinity: 0.2,
        }
    }
}

/// Multi-node scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of the global pending-request queue
    pub queue_capacity: usize,
    /// Period of the statistics refresh loop
    pub stats_interval_ms: u64,
    /// Memory figure that normalises a node's available memory into [0, 1]
    pub reference_memory_mb: u64,
    /// Memory requirement assumed for requests that give none
    pub default_memory_requirement_mb: u64,
    pub weights: ScoringWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            stats_interval_ms: 1000,
            reference_memory_mb: 8192,
            default_memory_requirement_mb: 512,
            weights: ScoringWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(CobaltError::config("queue_capacity must be positive"));
        }
        if self.stats_interval_ms == 0 {
            return Err(CobaltError::config("stats_interval_ms must be positive"));
        }
        if self.reference_memory_mb == 0 {
            return Err(CobaltError::config("reference_memory_mb must be positive"));
        }
        let w = &self.weights;
        if [w.memory, w.load, w.affinity]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(CobaltError::config("scoring weights must be finite and non-negative"));
        }
        Ok(())
    }
}
