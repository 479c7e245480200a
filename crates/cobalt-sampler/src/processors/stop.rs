//! Minimum-length enforcement

use cobalt_types::{Result, TokenId};

use super::LogitsProcessor;

/// Masks stop tokens until `min_tokens` tokens have been generated
#[derive(Debug, Clone)]
pub struct StopTokenSuppressor {
    stop_tokens: Vec<TokenId>,
    min_tokens: usize,
}

impl StopTokenSuppressor {
    pub fn new(stop_tokens: Vec<TokenId>, min_tokens: usize) -> Self {
        Self {
            stop_tokens,
            min_tokens,
        }
    }
}

impl LogitsProcessor for StopTokenSuppressor {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()> {
        if history.len() >= self.min_tokens {
            return Ok(());
        }
        for token in &self.stop_tokens {
            if let Some(logit) = logits.get_mut(token.index()) {
                *logit = f32::NEG_INFINITY;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "stop_token_suppressor"
    }
}
