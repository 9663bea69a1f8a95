//! Error types for fleet backends and configuration.

use thiserror::Error;

/// Result type alias for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors raised by backends, configuration loading, and host modelling.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("backend call {operation} failed: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },

    #[error("container instance {node_id} has no {resource} resource")]
    MissingResource {
        node_id: String,
        resource: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Shorthand for a failed backend call.
    pub fn backend(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            message: message.into(),
        }
    }
}
