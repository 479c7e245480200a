//! Error types for the cobalt serving core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for cobalt operations
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum CobaltError {
    /// Invalid construction parameters; fatal until the configuration is fixed
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Device memory could not be obtained for a buffer
    #[error("Allocation error: {message}")]
    Allocation { message: String },

    /// A memory budget or concurrency slot is exhausted
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Reference to an unregistered layer, model, node or request
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Compute backend failure in the middle of generation
    #[error("Execution error: {message}")]
    Execution { message: String },

    /// Invalid call arguments
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Operation not permitted in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Request was cancelled
    #[error("Request cancelled: {message}")]
    Cancelled { message: String },

    /// Scheduling/queue errors
    #[error("Scheduler error: {message}")]
    Scheduler { message: String },

    /// I/O errors
    #[error("I/O error: {message}")]
    IO { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CobaltError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an allocation error
    pub fn allocation(message: impl Into<String>) -> Self {
        Self::Allocation {
            message: message.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a cancelled error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a scheduler error
    pub fn scheduler(message: impl Into<String>) -> Self {
        Self::Scheduler {
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(message: impl Into<String>) -> Self {
        Self::IO {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Retryable once resources change (smaller batch, evicted cache, unloaded model).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. } | Self::ResourceExhausted { .. }
        )
    }

    /// Caller mistakes that retrying will not fix
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::NotFound { .. }
                | Self::InvalidParameter { .. }
                | Self::Cancelled { .. }
        )
    }

    /// Failures originating inside the serving core
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Allocation { .. }
                | Self::ResourceExhausted { .. }
                | Self::Execution { .. }
                | Self::InvalidState { .. }
                | Self::Scheduler { .. }
                | Self::Internal { .. }
        )
    }
}

impl From<std::io::Error> for CobaltError {
    fn from(err: std::io::Error) -> Self {
        Self::io(format!("{}", err))
    }
}

impl From<serde_json::Error> for CobaltError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("{}", err))
    }
}

impl From<toml::de::Error> for CobaltError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(format!("invalid TOML: {}", err))
    }
}
