//! Top-K filtering

use cobalt_types::{Result, TokenId};

use super::LogitsProcessor;
use crate::distribution::descending_order;

/// Keeps exactly the `k` highest scores and masks the rest to −∞.
///
/// Among equal scores the earlier index wins, so the surviving set never
/// exceeds `k`. `k == 0` disables the filter.
#[derive(Debug, Clone)]
pub struct TopKProcessor {
    k: usize,
}

impl TopKProcessor {
    pub fn new(k: usize) -> Self {
        Self { k }
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

impl LogitsProcessor for TopKProcessor {
    fn process(&self, logits: &mut [f32], _history: &[TokenId]) -> Result<()> {
        if self.k == 0 || self.k >= logits.len() {
            return Ok(());
        }
        for &index in &descending_order(logits)[self.k..] {
            logits[index] = f32::NEG_INFINITY;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "top_k"
    }
}
