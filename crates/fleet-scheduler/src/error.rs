//! Scheduling error taxonomy delivered to callbacks.

use fleet_core::FleetError;
use thiserror::Error;

/// Why a request was not placed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("capacity not available")]
    CapacityExhausted,

    #[error("no container instance currently available: {0}")]
    Backend(String),

    #[error(
        "request for {cpu} CPU / {memory} MB exceeds the largest instance ({max_cpu} CPU / {max_memory} MB)"
    )]
    RequestTooLarge {
        cpu: u32,
        memory: u32,
        max_cpu: u32,
        max_memory: u32,
    },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulingError {
    /// Whether resubmitting the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExhausted | Self::Backend(_))
    }
}

impl From<FleetError> for SchedulingError {
    fn from(e: FleetError) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_taxonomy() {
        assert!(SchedulingError::CapacityExhausted.is_retryable());
        assert!(SchedulingError::Backend("throttled".to_string()).is_retryable());
        assert!(!SchedulingError::ShuttingDown.is_retryable());
        assert!(
            !SchedulingError::RequestTooLarge {
                cpu: 1,
                memory: 1,
                max_cpu: 0,
                max_memory: 0
            }
            .is_retryable()
        );
    }

    #[test]
    fn backend_errors_keep_only_the_message() {
        let err: SchedulingError = FleetError::backend("describe_instances", "throttled").into();
        assert_eq!(
            err,
            SchedulingError::Backend("backend call describe_instances failed: throttled".to_string())
        );
    }
}
