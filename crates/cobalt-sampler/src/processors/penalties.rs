//! Penalties on tokens already generated

use cobalt_types::{Result, TokenId};
use std::collections::HashMap;

use super::LogitsProcessor;

fn occurrences(history: &[TokenId], vocab: usize) -> HashMap<usize, usize> {
    let mut counts = HashMap::new();
    for token in history {
        if token.index() < vocab {
            *counts.entry(token.index()).or_insert(0) += 1;
        }
    }
    counts
}

/// Divides positive scores and multiplies negative scores of seen tokens.
///
/// Penalty > 1.0 discourages repetition.
#[derive(Debug, Clone)]
pub struct RepetitionPenaltyProcessor {
    penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for RepetitionPenaltyProcessor {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()> {
        if (self.penalty - 1.0).abs() < f32::EPSILON {
            return Ok(());
        }
        for index in occurrences(history, logits.len()).into_keys() {
            let logit = &mut logits[index];
            if *logit > 0.0 {
                *logit /= self.penalty;
            } else {
                *logit *= self.penalty;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "repetition_penalty"
    }
}

/// Subtracts a flat penalty once from every seen token
#[derive(Debug, Clone)]
pub struct PresencePenaltyProcessor {
    penalty: f32,
}

impl PresencePenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for PresencePenaltyProcessor {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()> {
        for index in occurrences(history, logits.len()).into_keys() {
            logits[index] -= self.penalty;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "presence_penalty"
    }
}

/// Subtracts the penalty once per occurrence of a seen token
#[derive(Debug, Clone)]
pub struct FrequencyPenaltyProcessor {
    penalty: f32,
}

impl FrequencyPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitsProcessor for FrequencyPenaltyProcessor {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()> {
        for (index, count) in occurrences(history, logits.len()) {
            logits[index] -= self.penalty * count as f32;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "frequency_penalty"
    }
}
