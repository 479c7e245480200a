//! Model descriptors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CobaltError, ModelId, NodeId, Result, TokenId};

/// Resolved description of a model: where it lives, what it costs and its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub path: String,
    /// Weight footprint reserved on the hosting node
    pub memory_mb: u64,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub max_sequence_length: usize,
    pub bos_token: TokenId,
    pub eos_token: TokenId,
}

impl ModelSpec {
    /// Width of the residual stream
    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 || self.num_heads == 0 || self.head_dim == 0 {
            return Err(CobaltError::config(format!(
                "model {} has a zero dimension (layers={}, heads={}, head_dim={})",
                self.path, self.num_layers, self.num_heads, self.head_dim
            )));
        }
        if self.vocab_size == 0 || self.max_sequence_length == 0 {
            return Err(CobaltError::config(format!(
                "model {} needs a non-empty vocabulary and sequence length",
                self.path
            )));
        }
        if self.bos_token.index() >= self.vocab_size || self.eos_token.index() >= self.vocab_size
        {
            return Err(CobaltError::config(format!(
                "model {} special tokens fall outside the vocabulary",
                self.path
            )));
        }
        Ok(())
    }
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            path: String::new(),
            memory_mb: 1024,
            num_layers: 2,
            num_heads: 2,
            head_dim: 8,
            vocab_size: 64,
            max_sequence_length: 2048,
            bos_token: TokenId(1),
            eos_token: TokenId(2),
        }
    }
}

/// A model resident on a compute node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: ModelId,
    pub node_id: NodeId,
    pub spec: ModelSpec,
    pub loading_time_ms: f64,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub requests_served: u64,
}
