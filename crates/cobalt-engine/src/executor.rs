//! Transformer step execution
//!
//! One forward step embeds the incoming token of every batch row, then for
//! each layer projects query/key/value, appends key/value to the KV cache at
//! the step's position, attends over every cached position of the row and
//! runs the feed-forward block. The last hidden state becomes the score
//! vector handed to the sampler.

use cobalt_kv::KvCacheManager;
use cobalt_runtime::{ComputeBackend, ComputeOp};
use cobalt_sampler::{Sampler, SamplingStrategy};
use cobalt_types::{CobaltError, FinishReason, ModelSpec, Result, StreamId, TokenId};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

/// Runs forward steps for one model on one stream and cache
pub struct TransformerStepExecutor<'a> {
    backend: &'a dyn ComputeBackend,
    cache: &'a KvCacheManager,
    stream: StreamId,
    spec: &'a ModelSpec,
}

/// What a generation loop produced, including partial output on failure
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
    pub error: Option<CobaltError>,
    pub steps: usize,
}

impl GenerationOutcome {
    fn failed(tokens: Vec<TokenId>, steps: usize, error: CobaltError) -> Self {
        let finish_reason = if matches!(error, CobaltError::Cancelled { .. }) {
            FinishReason::Cancelled
        } else {
            FinishReason::Error
        };
        Self {
            tokens,
            finish_reason,
            error: Some(error),
            steps,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl<'a> TransformerStepExecutor<'a> {
    pub fn new(
        backend: &'a dyn ComputeBackend,
        cache: &'a KvCacheManager,
        stream: StreamId,
        spec: &'a ModelSpec,
    ) -> Self {
        Self {
            backend,
            cache,
            stream,
            spec,
        }
    }

    fn run(&self, op: ComputeOp<'_>) -> Result<()> {
        self.backend.execute(op, self.stream)
    }

    /// Run one step for `tokens.len()` batch rows at sequence `position`.
    ///
    /// Returns one score vector per row. The cache must already hold an
    /// entry for every layer with room for `position + 1` positions.
    pub fn forward(&self, tokens: &[TokenId], position: usize) -> Result<Vec<Vec<f32>>> {
        let batch = tokens.len();
        let hidden_size = self.spec.hidden_size();
        if batch == 0 {
            return Err(CobaltError::invalid_parameter("forward step needs at least one token"));
        }
        if let Some(t) = tokens.iter().find(|t| t.index() >= self.spec.vocab_size) {
            return Err(CobaltError::invalid_parameter(format!(
                "{} is outside the vocabulary of {}",
                t, self.spec.vocab_size
            )));
        }

        let mut hidden = vec![vec![0.0f32; hidden_size]; batch];
        for (row, token) in hidden.iter_mut().zip(tokens) {
            self.run(ComputeOp::Embed {
                token: *token,
                output: row,
            })?;
        }

        let mut query = vec![0.0f32; batch * hidden_size];
        let mut keys = vec![0.0f32; batch * hidden_size];
        let mut values = vec![0.0f32; batch * hidden_size];
        let mut attended = vec![0.0f32; hidden_size];

        for layer in 0..self.spec.num_layers {
            for (b, row) in hidden.iter().enumerate() {
                let span = b * hidden_size..(b + 1) * hidden_size;
                self.run(ComputeOp::Project {
                    layer,
                    input: row,
                    query: &mut query[span.clone()],
                    key: &mut keys[span.clone()],
                    value: &mut values[span],
                })?;
            }
            self.cache
                .update_cache(layer, &keys, &values, batch, 1, position)?;

            for (b, row) in hidden.iter_mut().enumerate() {
                let cached = self.cache.read_cache(layer, b, position + 1)?;
                self.run(ComputeOp::Attention {
                    layer,
                    num_heads: self.spec.num_heads,
                    head_dim: self.spec.head_dim,
                    query: &query[b * hidden_size..(b + 1) * hidden_size],
                    keys: &cached.keys,
                    values: &cached.values,
                    output: &mut attended,
                })?;
                for (h, a) in row.iter_mut().zip(&attended) {
                    *h += a;
                }
                self.run(ComputeOp::FeedForward { layer, hidden: row })?;
            }
        }

        let mut scores = Vec::with_capacity(batch);
        for row in &hidden {
            let mut logits = vec![0.0f32; self.spec.vocab_size];
            self.run(ComputeOp::Logits {
                hidden: row,
                logits: &mut logits,
            })?;
            scores.push(logits);
        }
        trace!("forward step at position {} for {} rows", position, batch);
        Ok(scores)
    }

    /// Feed the prompt one position at a time; returns the scores after its last token.
    fn prefill(&self, prompt: &[TokenId]) -> Result<Vec<f32>> {
        let mut last = Vec::new();
        for (position, token) in prompt.iter().enumerate() {
            last = self.forward(&[*token], position)?.swap_remove(0);
        }
        Ok(last)
    }

    fn check_budget(&self, prompt_len: usize, max_tokens: usize) -> Result<usize> {
        let total = prompt_len + max_tokens;
        if total > self.spec.max_sequence_length {
            return Err(CobaltError::invalid_parameter(format!(
                "prompt of {} plus {} new tokens exceeds the model's {} positions",
                prompt_len, max_tokens, self.spec.max_sequence_length
            )));
        }
        Ok(total)
    }

    /// Generate until the sampler reports a stop, the token bound is hit, or
    /// `cancelled` is raised between steps.
    ///
    /// Never returns an error: failures come back in the outcome together
    /// with the tokens produced so far.
    pub fn generate(
        &self,
        prompt: &[TokenId],
        sampler: &mut Sampler,
        cancelled: &AtomicBool,
    ) -> GenerationOutcome {
        let prompt: Vec<TokenId> = if prompt.is_empty() {
            vec![self.spec.bos_token]
        } else {
            prompt.to_vec()
        };
        if sampler.strategy() == SamplingStrategy::Beam {
            self.generate_beam(&prompt, sampler, cancelled)
        } else {
            self.generate_sampled(&prompt, sampler, cancelled)
        }
    }

    fn generate_sampled(
        &self,
        prompt: &[TokenId],
        sampler: &mut Sampler,
        cancelled: &AtomicBool,
    ) -> GenerationOutcome {
        let mut generated = Vec::new();
        let mut steps = 0;
        let result = (|| -> Result<FinishReason> {
            let max_tokens = sampler.config().max_tokens;
            let total = self.check_budget(prompt.len(), max_tokens)?;
            self.cache.allocate_all(1, total)?;

            let mut scores = self.prefill(prompt)?;
            let mut position = prompt.len();
            loop {
                if cancelled.load(Ordering::Acquire) {
                    return Err(CobaltError::cancelled(format!(
                        "cancelled after {} tokens",
                        generated.len()
                    )));
                }
                let sampled = sampler.sample(&scores, self.spec.vocab_size, &generated)?;
                let token = sampled.token();
                generated.push(token);
                steps += 1;
                if let Some(reason) = sampled.finish_reason {
                    return Ok(reason);
                }
                scores = self.forward(&[token], position)?.swap_remove(0);
                position += 1;
            }
        })();

        match result {
            Ok(finish_reason) => {
                debug!(
                    "generated {} tokens in {} steps ({:?})",
                    generated.len(),
                    steps,
                    finish_reason
                );
                GenerationOutcome {
                    tokens: generated,
                    finish_reason,
                    error: None,
                    steps,
                }
            }
            Err(e) => GenerationOutcome::failed(generated, steps, e),
        }
    }

    fn generate_beam(
        &self,
        prompt: &[TokenId],
        sampler: &Sampler,
        cancelled: &AtomicBool,
    ) -> GenerationOutcome {
        let mut search = match sampler.beam_search() {
            Ok(search) => search,
            Err(e) => return GenerationOutcome::failed(Vec::new(), 0, e),
        };
        let result = (|| -> Result<()> {
            let width = search.width();
            let total = self.check_budget(prompt.len(), sampler.config().max_tokens)?;
            self.cache.allocate_all(width, total)?;

            let mut scores = vec![self.prefill(prompt)?];
            let mut position = prompt.len();
            loop {
                if cancelled.load(Ordering::Acquire) {
                    return Err(CobaltError::cancelled(format!(
                        "cancelled after {} beam steps",
                        search.steps()
                    )));
                }
                let step = search.step(&scores, self.spec.vocab_size)?;
                if step.is_finished {
                    return Ok(());
                }
                for layer in 0..self.spec.num_layers {
                    self.cache.reorder_batch(layer, &step.parents, position)?;
                }
                let tokens: Vec<TokenId> = search
                    .beams()
                    .iter()
                    .map(|b| b.last_token().unwrap_or(self.spec.bos_token))
                    .collect();
                scores = self.forward(&tokens, position)?;
                position += 1;
            }
        })();

        let best = search.best().clone();
        let steps = search.steps();
        match result {
            Ok(()) => GenerationOutcome {
                tokens: best.tokens,
                finish_reason: best.finish_reason.unwrap_or(FinishReason::BeamConverged),
                error: None,
                steps,
            },
            Err(e) => GenerationOutcome::failed(best.tokens, steps, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cobalt_runtime::{DeviceMemoryPool, HostBackend};
    use cobalt_types::{DataType, KvCacheConfig, SamplingConfig};

    struct Fixture {
        backend: HostBackend,
        cache: KvCacheManager,
        stream: StreamId,
        spec: ModelSpec,
    }

    fn fixture(batch: usize) -> Fixture {
        let spec = ModelSpec {
            max_sequence_length: 64,
            ..Default::default()
        };
        let backend = HostBackend::new(1);
        let stream = backend.create_stream(0).unwrap();
        let pool = DeviceMemoryPool::new(0, 1 << 22);
        let cache = KvCacheManager::new(
            KvCacheConfig {
                max_batch_size: batch,
                max_sequence_length: 64,
                num_heads: spec.num_heads,
                head_dim: spec.head_dim,
                num_layers: spec.num_layers,
                dtype: DataType::FP32,
            },
            pool,
        )
        .unwrap();
        Fixture {
            backend,
            cache,
            stream,
            spec,
        }
    }

    impl Fixture {
        fn executor(&self) -> TransformerStepExecutor<'_> {
            TransformerStepExecutor::new(&self.backend, &self.cache, self.stream, &self.spec)
        }
    }

    fn greedy(max_tokens: usize) -> Sampler {
        Sampler::new(
            SamplingStrategy::Greedy,
            SamplingConfig {
                max_tokens,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn forward_appends_to_the_cache() {
        let f = fixture(1);
        f.cache.allocate_all(1, 8).unwrap();
        let exec = f.executor();
        let scores = exec.forward(&[TokenId(3)], 0).unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].len(), f.spec.vocab_size);
        assert_eq!(f.cache.get_cache(0).unwrap().filled_length, 1);
        exec.forward(&[TokenId(4)], 1).unwrap();
        assert_eq!(f.cache.get_cache(1).unwrap().filled_length, 2);
    }

    #[test]
    fn forward_without_cache_fails() {
        let f = fixture(1);
        let err = f.executor().forward(&[TokenId(3)], 0).unwrap_err();
        assert!(matches!(err, CobaltError::NotFound { .. }));
    }

    #[test]
    fn greedy_generation_is_deterministic_and_bounded() {
        let f = fixture(1);
        let never = AtomicBool::new(false);
        let a = f.executor().generate(&[TokenId(5), TokenId(9)], &mut greedy(6), &never);
        f.cache.clear_cache();
        let b = f.executor().generate(&[TokenId(5), TokenId(9)], &mut greedy(6), &never);
        assert!(a.is_success());
        assert!(a.tokens.len() <= 6);
        assert_eq!(a.tokens, b.tokens);
    }

    #[test]
    fn empty_prompt_starts_from_bos() {
        let f = fixture(1);
        let out = f
            .executor()
            .generate(&[], &mut greedy(3), &AtomicBool::new(false));
        assert!(out.is_success());
        assert!(!out.tokens.is_empty());
    }

    #[test]
    fn cancellation_is_checked_between_steps() {
        let f = fixture(1);
        let out = f
            .executor()
            .generate(&[TokenId(5)], &mut greedy(10), &AtomicBool::new(true));
        assert_eq!(out.finish_reason, FinishReason::Cancelled);
        assert!(out.tokens.is_empty());
        assert!(!out.is_success());
    }

    #[test]
    fn sequence_budget_is_enforced() {
        let f = fixture(1);
        let out = f
            .executor()
            .generate(&[TokenId(5)], &mut greedy(100), &AtomicBool::new(false));
        assert!(matches!(out.error, Some(CobaltError::InvalidParameter { .. })));
    }

    #[test]
    fn beam_generation_returns_best_beam() {
        let f = fixture(2);
        let mut sampler = Sampler::new(
            SamplingStrategy::Beam,
            SamplingConfig {
                beam_width: 2,
                max_tokens: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let out = f
            .executor()
            .generate(&[TokenId(7)], &mut sampler, &AtomicBool::new(false));
        assert!(out.is_success(), "{:?}", out.error);
        assert!(!out.tokens.is_empty() && out.tokens.len() <= 4);
        assert_eq!(f.cache.get_cache(0).unwrap().batch_size, 2);
    }
}
