//! # cobalt-runtime
//!
//! Accelerator abstraction for the serving core: budgeted device memory with
//! owning buffer handles, and the compute backend capability that runs the
//! tensor operations of a transformer step.

pub mod backends;
pub mod memory;
pub mod traits;

pub use backends::*;
pub use memory::*;
pub use traits::*;

pub use cobalt_types::{DataType, Result};
