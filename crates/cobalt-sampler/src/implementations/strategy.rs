//! The closed set of decoding policies

use cobalt_types::{
    CobaltError, FinishReason, Result, SamplingConfig, SamplingStrategyKind, TokenId,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::trace;

use super::beam::{self, BeamSearch};
use super::factory::SamplerFactory;
use super::greedy;
use super::stochastic::{self, Filter};
use crate::processors::{LogitsProcessor, ProcessorChain};
use crate::result::SamplingResult;

/// A decoding policy mapping a score vector to the next token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Arg-max, deterministic
    Greedy,
    /// Temperature-scaled categorical draw
    Temperature,
    /// Categorical draw over the `top_k` best scores
    TopK,
    /// Categorical draw over the nucleus reaching `top_p`
    TopP,
    /// Ranked candidates for `beam_width` beams
    Beam,
}

impl SamplingStrategy {
    pub fn kind(&self) -> SamplingStrategyKind {
        match self {
            SamplingStrategy::Greedy => SamplingStrategyKind::Greedy,
            SamplingStrategy::Temperature => SamplingStrategyKind::Temperature,
            SamplingStrategy::TopK => SamplingStrategyKind::TopK,
            SamplingStrategy::TopP => SamplingStrategyKind::TopP,
            SamplingStrategy::Beam => SamplingStrategyKind::Beam,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Same scores always give the same token
    pub fn is_deterministic(&self) -> bool {
        matches!(self, SamplingStrategy::Greedy | SamplingStrategy::Beam)
    }

    /// Choose the next token from `scores[..vocab_size]`.
    ///
    /// `history` holds the tokens generated so far; it feeds the penalties,
    /// the minimum-length rule and the max-length stop.
    pub fn sample(
        &self,
        scores: &[f32],
        vocab_size: usize,
        history: &[TokenId],
        config: &SamplingConfig,
        rng: &mut dyn RngCore,
    ) -> Result<SamplingResult> {
        let chain = SamplerFactory::processor_chain(config);
        self.sample_with(&chain, scores, vocab_size, history, config, rng)
    }

    pub(crate) fn sample_with(
        &self,
        chain: &ProcessorChain,
        scores: &[f32],
        vocab_size: usize,
        history: &[TokenId],
        config: &SamplingConfig,
        rng: &mut dyn RngCore,
    ) -> Result<SamplingResult> {
        let mut working = prepare_scores(chain, scores, vocab_size, history)?;

        let (token_ids, score, probabilities) = match self {
            SamplingStrategy::Greedy => {
                let (token, score, probs) = greedy::select(&working)?;
                (vec![token], score, probs)
            }
            SamplingStrategy::Temperature => {
                let (token, lp, probs) =
                    stochastic::select(&mut working, config, Filter::None, rng)?;
                (vec![token], lp, probs)
            }
            SamplingStrategy::TopK => {
                let (token, lp, probs) =
                    stochastic::select(&mut working, config, Filter::TopK, rng)?;
                (vec![token], lp, probs)
            }
            SamplingStrategy::TopP => {
                let (token, lp, probs) =
                    stochastic::select(&mut working, config, Filter::TopP, rng)?;
                (vec![token], lp, probs)
            }
            SamplingStrategy::Beam => beam::rank_candidates(&working, config.beam_width)?,
        };

        let finish_reason = finish_reason(token_ids[0], history.len() + 1, config);
        trace!(
            "{} picked {} (score {:.4}, finished {:?})",
            self.name(),
            token_ids[0],
            score,
            finish_reason
        );
        Ok(SamplingResult {
            token_ids,
            scores: working,
            probabilities,
            score,
            is_finished: finish_reason.is_some(),
            finish_reason,
        })
    }
}

impl From<SamplingStrategyKind> for SamplingStrategy {
    fn from(kind: SamplingStrategyKind) -> Self {
        match kind {
            SamplingStrategyKind::Greedy => SamplingStrategy::Greedy,
            SamplingStrategyKind::Temperature => SamplingStrategy::Temperature,
            SamplingStrategyKind::TopK => SamplingStrategy::TopK,
            SamplingStrategyKind::TopP => SamplingStrategy::TopP,
            SamplingStrategyKind::Beam => SamplingStrategy::Beam,
        }
    }
}

/// Copy the vocabulary slice and run the penalty chain over it.
///
/// NaN scores mean the step that produced them went wrong and fail as an
/// execution error.
pub(crate) fn prepare_scores(
    chain: &ProcessorChain,
    scores: &[f32],
    vocab_size: usize,
    history: &[TokenId],
) -> Result<Vec<f32>> {
    if vocab_size == 0 || scores.len() < vocab_size {
        return Err(CobaltError::invalid_parameter(format!(
            "score vector of {} entries cannot cover a vocabulary of {}",
            scores.len(),
            vocab_size
        )));
    }
    if let Some(index) = scores[..vocab_size].iter().position(|s| s.is_nan()) {
        return Err(CobaltError::execution(format!(
            "score vector has NaN at token {}",
            index
        )));
    }
    let mut working = scores[..vocab_size].to_vec();
    chain.process(&mut working, history)?;
    Ok(working)
}

/// Stop condition after emitting `token` as the `length`-th generated token.
pub(crate) fn finish_reason(
    token: TokenId,
    length: usize,
    config: &SamplingConfig,
) -> Option<FinishReason> {
    if config.is_stop_token(token) {
        Some(FinishReason::Stop)
    } else if length >= config.max_tokens {
        Some(FinishReason::Length)
    } else {
        None
    }
}

/// A strategy bound to one request's parameters and random stream
#[derive(Debug)]
pub struct Sampler {
    strategy: SamplingStrategy,
    config: SamplingConfig,
    chain: ProcessorChain,
    rng: StdRng,
}

impl Sampler {
    pub fn new(strategy: SamplingStrategy, config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            strategy,
            chain: SamplerFactory::processor_chain(&config),
            config,
            rng,
        })
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn sample(
        &mut self,
        scores: &[f32],
        vocab_size: usize,
        history: &[TokenId],
    ) -> Result<SamplingResult> {
        self.strategy.sample_with(
            &self.chain,
            scores,
            vocab_size,
            history,
            &self.config,
            &mut self.rng,
        )
    }

    /// Fresh beam search state for this sampler's parameters
    pub fn beam_search(&self) -> Result<BeamSearch> {
        BeamSearch::new(self.config.clone())
    }
}
