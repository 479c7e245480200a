//! Core type definitions for the cobalt serving core
//!
//! Identifiers, the error type, request/response values, node descriptors and
//! the configuration structs shared by every other crate in the workspace.

pub mod config;
pub mod devices;
pub mod errors;
pub mod ids;
pub mod metrics;
pub mod models;
pub mod nodes;
pub mod requests;
pub mod sampling;

pub use config::*;
pub use devices::*;
pub use errors::*;
pub use ids::*;
pub use metrics::*;
pub use models::*;
pub use nodes::*;
pub use requests::*;
pub use sampling::*;

/// Result type used throughout cobalt
pub type Result<T> = std::result::Result<T, CobaltError>;
