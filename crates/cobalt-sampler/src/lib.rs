//! # cobalt-sampler
//!
//! Turns output-distribution scores into the next token.
//!
//! - Logits processors: penalties, minimum length, temperature, top-k, top-p
//! - Strategies: greedy, temperature, top-k, top-p and beam, as one closed enum
//! - [`BeamSearch`] for multi-step beam decoding
//! - Seeded random streams for reproducible sampling

pub mod distribution;
pub mod implementations;
pub mod processors;
pub mod result;

pub use implementations::*;
pub use processors::*;
pub use result::SamplingResult;

pub use cobalt_types::{CobaltError, Result, SamplingConfig, SamplingStrategyKind, TokenId};
