//! Nucleus (top-p) filtering

use cobalt_types::{Result, TokenId};

use super::LogitsProcessor;
use crate::distribution::{descending_order, softmax};

/// Keeps the smallest prefix of the descending distribution whose mass reaches `p`.
///
/// The highest-scoring token always survives. `p >= 1.0` disables the filter.
#[derive(Debug, Clone)]
pub struct TopPProcessor {
    p: f32,
}

impl TopPProcessor {
    pub fn new(p: f32) -> Self {
        Self { p }
    }

    pub fn p(&self) -> f32 {
        self.p
    }
}

impl LogitsProcessor for TopPProcessor {
    fn process(&self, logits: &mut [f32], _history: &[TokenId]) -> Result<()> {
        if self.p >= 1.0 || logits.is_empty() {
            return Ok(());
        }
        let probs = softmax(logits)?;
        let order = descending_order(&probs);

        let mut cumulative = 0.0f32;
        let mut keep = order.len();
        for (rank, &index) in order.iter().enumerate() {
            cumulative += probs[index];
            if cumulative >= self.p {
                keep = rank + 1;
                break;
            }
        }
        for &index in &order[keep..] {
            logits[index] = f32::NEG_INFINITY;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "top_p"
    }
}
