//! Strategy and processor-chain construction

use cobalt_types::{Result, SamplingConfig, SamplingStrategyKind};
use tracing::debug;

use super::strategy::{Sampler, SamplingStrategy};
use crate::processors::{
    FrequencyPenaltyProcessor, PresencePenaltyProcessor, ProcessorChain,
    RepetitionPenaltyProcessor, StopTokenSuppressor,
};

/// Builds strategies from selectors and penalty chains from configs
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerFactory;

impl SamplerFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn create(kind: SamplingStrategyKind) -> SamplingStrategy {
        SamplingStrategy::from(kind)
    }

    /// Strategy by name; unknown names fail with a configuration error.
    pub fn create_from_name(name: &str) -> Result<SamplingStrategy> {
        Ok(Self::create(name.parse()?))
    }

    /// Strategy bound to validated parameters and a seeded random stream
    pub fn create_sampler(kind: SamplingStrategyKind, config: SamplingConfig) -> Result<Sampler> {
        debug!("creating {} sampler", kind);
        Sampler::new(Self::create(kind), config)
    }

    /// Processors run before every strategy: penalties, then the minimum-length rule.
    pub fn processor_chain(config: &SamplingConfig) -> ProcessorChain {
        let mut chain = ProcessorChain::new();
        if (config.repetition_penalty - 1.0).abs() > f32::EPSILON {
            chain.add(RepetitionPenaltyProcessor::new(config.repetition_penalty));
        }
        if config.presence_penalty.abs() > f32::EPSILON {
            chain.add(PresencePenaltyProcessor::new(config.presence_penalty));
        }
        if config.frequency_penalty.abs() > f32::EPSILON {
            chain.add(FrequencyPenaltyProcessor::new(config.frequency_penalty));
        }
        if config.min_tokens > 0 && !config.stop_tokens.is_empty() {
            chain.add(StopTokenSuppressor::new(
                config.stop_tokens.clone(),
                config.min_tokens,
            ));
        }
        chain
    }

    pub fn supported() -> [SamplingStrategyKind; 5] {
        [
            SamplingStrategyKind::Greedy,
            SamplingStrategyKind::Temperature,
            SamplingStrategyKind::TopK,
            SamplingStrategyKind::TopP,
            SamplingStrategyKind::Beam,
        ]
    }
}
