//! # cobalt-engine
//!
//! Runs generation on a device: the [`TransformerStepExecutor`] drives the
//! compute backend, KV cache and sampler through a request, and a
//! [`VirtualComputeNode`] wraps one device's memory, streams and resident
//! models behind load/unload and process-request operations.

pub mod detokenizer;
pub mod executor;
pub mod node;
pub mod registry;
pub mod streams;

pub use detokenizer::{Detokenizer, TokenIdRenderer};
pub use executor::{GenerationOutcome, TransformerStepExecutor};
pub use node::{VirtualComputeNode, DEFAULT_MEMORY_REQUIREMENT_MB};
pub use registry::{ModelRegistry, StaticModelRegistry};
pub use streams::{StreamLease, StreamPool, StreamSlot};

pub use cobalt_types::{CobaltError, Result};
