//! Logits processors applied before token selection

pub mod chain;
pub mod penalties;
pub mod stop;
pub mod temperature;
pub mod top_k;
pub mod top_p;

use cobalt_types::{Result, TokenId};

pub use chain::ProcessorChain;
pub use penalties::{
    FrequencyPenaltyProcessor, PresencePenaltyProcessor, RepetitionPenaltyProcessor,
};
pub use stop::StopTokenSuppressor;
pub use temperature::TemperatureProcessor;
pub use top_k::TopKProcessor;
pub use top_p::TopPProcessor;

/// A transformation of a score vector in place.
///
/// `history` holds the tokens generated so far for the sequence being scored.
pub trait LogitsProcessor: Send + Sync + std::fmt::Debug {
    fn process(&self, logits: &mut [f32], history: &[TokenId]) -> Result<()>;

    fn name(&self) -> &str;
}
