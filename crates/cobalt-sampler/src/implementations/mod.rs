//! Decoding strategies

pub mod beam;
pub mod factory;
pub mod greedy;
pub mod stochastic;
pub mod strategy;

pub use beam::{Beam, BeamSearch, BeamStep};
pub use factory::SamplerFactory;
pub use strategy::{Sampler, SamplingStrategy};
