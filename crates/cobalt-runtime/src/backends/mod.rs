//! Compute backend implementations

pub mod host;

pub use host::HostBackend;
