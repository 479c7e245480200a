//! Device memory management

pub mod pool;
pub mod stats;

pub use pool::{DeviceBuffer, DeviceMemoryPool, MemoryReservation};
pub use stats::MemoryStats;
