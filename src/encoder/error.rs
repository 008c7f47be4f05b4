//! Pipeline error types
//!
//! Only two failures are visible to a well-behaved caller: pool exhaustion
//! (drop the frame upstream and try again next cycle) and fatal backend
//! errors (tear the encoder down). Per-frame submission failures never show
//! up here; they arrive as zero-payload packets.

use thiserror::Error;

use crate::backend::{BackendError, RegistryError};

/// Unified error type for pipeline operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Every frame slot is in flight
    #[error("Frame pool exhausted ({capacity} slots in flight)")]
    PoolExhausted { capacity: usize },

    /// Backend failure (initialization or output query)
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// No registered factory supports the codec
    #[error("No backend available for codec '{codec}'")]
    NoFactory { codec: String },

    /// Registry refused the operation
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The encode thread has exited
    #[error("Encode thread is not running")]
    WorkerStopped,

    /// The encode thread could not be started
    #[error("Failed to start encode thread: {0}")]
    WorkerSpawn(String),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Listener registered twice
    #[error("Listener already registered")]
    ListenerAlreadyRegistered,

    /// Listener removed without being registered
    #[error("Listener not registered")]
    ListenerNotRegistered,
}

impl EncodeError {
    /// Caller should drop the frame and retry next cycle
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EncodeError::PoolExhausted { .. })
    }

    /// Caller should tear the encoder down and recreate it
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EncodeError::Backend(_) | EncodeError::WorkerStopped | EncodeError::WorkerSpawn(_)
        )
    }
}

/// Result type for pipeline operations
pub type EncodeResult<T> = Result<T, EncodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = EncodeError::PoolExhausted { capacity: 3 };
        assert!(err.is_recoverable());
        assert!(!err.is_fatal());

        let err: EncodeError = BackendError::DeviceLost("gpu reset".to_string()).into();
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());

        assert!(!EncodeError::ListenerNotRegistered.is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = EncodeError::PoolExhausted { capacity: 3 };
        assert!(err.to_string().contains("3 slots"));

        let err = EncodeError::NoFactory {
            codec: "av1".to_string(),
        };
        assert!(err.to_string().contains("av1"));
    }
}
