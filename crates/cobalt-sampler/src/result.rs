//! Sampling outcome

use cobalt_types::{FinishReason, TokenId};
use serde::{Deserialize, Serialize};

/// Output of one sampling call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingResult {
    /// Selected token first; beam sampling lists every beam candidate in rank order
    pub token_ids: Vec<TokenId>,
    /// Scores after penalties and masking, masked entries at −∞
    pub scores: Vec<f32>,
    /// Probabilities over the filtered scores
    pub probabilities: Vec<f32>,
    /// Greedy: the max score. Stochastic and beam: log-probability of the selection
    pub score: f32,
    pub is_finished: bool,
    pub finish_reason: Option<FinishReason>,
}

impl SamplingResult {
    /// The selected token
    pub fn token(&self) -> TokenId {
        self.token_ids[0]
    }
}
