//! Inference request and response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    FinishReason, ModelId, NodeId, Priority, RequestId, SamplingConfig, SamplingStrategyKind,
    TokenId,
};

/// A generation request as accepted by nodes and the scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub id: RequestId,
    pub model_id: ModelId,
    /// Free-form prompt text, carried for diagnostics only
    #[serde(default)]
    pub prompt: String,
    /// Prompt token ids; an empty prompt starts from the model's BOS token
    #[serde(default)]
    pub prompt_tokens: Vec<TokenId>,
    /// Maximum number of tokens to generate
    pub max_tokens: usize,
    #[serde(default)]
    pub strategy: SamplingStrategyKind,
    #[serde(default)]
    pub sampling: SamplingConfig,
    /// Memory the request needs on its node; the scheduler floor applies when unset
    #[serde(default)]
    pub memory_requirement_mb: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<ModelId>, prompt_tokens: Vec<TokenId>) -> Self {
        Self {
            id: RequestId::new(),
            model_id: model_id.into(),
            prompt: String::new(),
            prompt_tokens,
            max_tokens: 100,
            strategy: SamplingStrategyKind::default(),
            sampling: SamplingConfig::default(),
            memory_requirement_mb: None,
            priority: Priority::default(),
            user_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_strategy(mut self, strategy: SamplingStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_memory_requirement_mb(mut self, mb: u64) -> Self {
        self.memory_requirement_mb = Some(mb);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sampling parameters with the request-level token bound applied.
    pub fn effective_sampling(&self) -> SamplingConfig {
        SamplingConfig {
            max_tokens: self.max_tokens,
            min_tokens: self.sampling.min_tokens.min(self.max_tokens),
            ..self.sampling.clone()
        }
    }

    /// Memory requirement, falling back to `floor_mb` when the request gives none.
    pub fn memory_requirement_or(&self, floor_mb: u64) -> u64 {
        self.memory_requirement_mb.unwrap_or(floor_mb)
    }
}

/// Outcome of one inference request.
///
/// Failures never cross a node boundary as errors; they surface here with
/// `success == false` and whatever tokens were produced before the failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub request_id: RequestId,
    pub model_id: ModelId,
    pub generated_text: String,
    pub tokens: Vec<TokenId>,
    pub tokens_generated: usize,
    pub processing_time_ms: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub finish_reason: Option<FinishReason>,
    pub compute_node_id: Option<NodeId>,
    /// Node utilization observed at completion
    pub gpu_utilization: f32,
    /// Node memory utilization observed at completion
    pub memory_utilization: f32,
    /// Depth of the global queue when the request was enqueued (deferred path only)
    pub queue_position: Option<usize>,
    /// Time spent in the global queue before dispatch
    pub wait_time_ms: f64,
}

impl InferenceResponse {
    /// Empty successful response for `request`, to be filled by the caller.
    pub fn for_request(request: &InferenceRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            model_id: request.model_id.clone(),
            generated_text: String::new(),
            tokens: Vec::new(),
            tokens_generated: 0,
            processing_time_ms: 0.0,
            success: true,
            error_message: None,
            finish_reason: None,
            compute_node_id: None,
            gpu_utilization: 0.0,
            memory_utilization: 0.0,
            queue_position: None,
            wait_time_ms: 0.0,
        }
    }

    /// Failed response carrying a human-readable reason
    pub fn failure(request: &InferenceRequest, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            finish_reason: Some(FinishReason::Error),
            ..Self::for_request(request)
        }
    }
}
