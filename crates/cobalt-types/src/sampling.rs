//! Sampling and generation parameters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{CobaltError, Result, TokenId};

/// Per-request decoding parameters.
///
/// Passed by value into every sampling call and never mutated while a
/// generation is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Divides scores before softmax; must be strictly positive
    pub temperature: f32,
    /// Nucleus threshold in [0, 1]
    pub top_p: f32,
    /// Number of highest-scoring tokens kept by top-k (0 = disabled)
    pub top_k: usize,
    /// Number of beams tracked by beam search
    pub beam_width: usize,
    /// Multiplicative penalty applied to tokens already generated
    pub repetition_penalty: f32,
    /// Flat penalty subtracted once from every token already generated
    pub presence_penalty: f32,
    /// Penalty subtracted per occurrence of a token already generated
    pub frequency_penalty: f32,
    /// Tokens that end generation when sampled
    pub stop_tokens: Vec<TokenId>,
    /// Stop tokens are suppressed until this many tokens were generated
    pub min_tokens: usize,
    /// Upper bound on generated tokens
    pub max_tokens: usize,
    /// Random seed for reproducible stochastic sampling
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            beam_width: 1,
            repetition_penalty: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            stop_tokens: vec![],
            min_tokens: 0,
            max_tokens: 100,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Default parameters with a given temperature
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature,
            ..Default::default()
        }
    }

    /// Whether `token` ends generation
    pub fn is_stop_token(&self, token: TokenId) -> bool {
        self.stop_tokens.contains(&token)
    }

    /// Whether any penalty differs from its neutral value
    pub fn has_penalties(&self) -> bool {
        self.repetition_penalty != 1.0
            || self.presence_penalty != 0.0
            || self.frequency_penalty != 0.0
    }

    /// Validate sampling parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(CobaltError::config(format!(
                "temperature must be > 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(CobaltError::config(format!(
                "top_p must be in [0, 1], got {}",
                self.top_p
            )));
        }
        if self.beam_width == 0 {
            return Err(CobaltError::config("beam_width must be at least 1"));
        }
        if !(self.repetition_penalty.is_finite() && self.repetition_penalty > 0.0) {
            return Err(CobaltError::config(
                "repetition_penalty must be positive",
            ));
        }
        if self.max_tokens == 0 {
            return Err(CobaltError::config("max_tokens must be at least 1"));
        }
        if self.min_tokens > self.max_tokens {
            return Err(CobaltError::config(format!(
                "min_tokens ({}) exceeds max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Decoding policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategyKind {
    Greedy,
    Temperature,
    TopK,
    TopP,
    Beam,
}

impl Default for SamplingStrategyKind {
    fn default() -> Self {
        SamplingStrategyKind::Greedy
    }
}

impl SamplingStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategyKind::Greedy => "greedy",
            SamplingStrategyKind::Temperature => "temperature",
            SamplingStrategyKind::TopK => "top_k",
            SamplingStrategyKind::TopP => "top_p",
            SamplingStrategyKind::Beam => "beam",
        }
    }
}

impl fmt::Display for SamplingStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SamplingStrategyKind {
    type Err = CobaltError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greedy" => Ok(SamplingStrategyKind::Greedy),
            "temperature" => Ok(SamplingStrategyKind::Temperature),
            "top_k" | "topk" | "top-k" => Ok(SamplingStrategyKind::TopK),
            "top_p" | "topp" | "top-p" | "nucleus" => Ok(SamplingStrategyKind::TopP),
            "beam" | "beam_search" => Ok(SamplingStrategyKind::Beam),
            other => Err(CobaltError::config(format!(
                "unknown sampling strategy: {}",
                other
            ))),
        }
    }
}

/// Request priority levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Reason a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Hit the max token limit
    Length,
    /// Sampled a stop token
    Stop,
    /// Every beam finished
    BeamConverged,
    /// Request was cancelled
    Cancelled,
    /// Error occurred during generation
    Error,
}
