//! Device-side data types

use serde::{Deserialize, Serialize};

/// Element type of accelerator-resident cache buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 32-bit floating point
    FP32,
    /// 16-bit floating point (IEEE 754)
    FP16,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::FP32 => 4,
            DataType::FP16 => 2,
        }
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::FP16
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::FP32 => "fp32",
            DataType::FP16 => "fp16",
        };
        write!(f, "{}", name)
    }
}

/// Bytes per megabyte as used by every memory budget in this workspace.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Convert a megabyte figure to bytes.
pub const fn mb_to_bytes(mb: u64) -> u64 {
    mb * BYTES_PER_MB
}

/// Convert bytes to (fractional) megabytes for reporting.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB as f64
}
