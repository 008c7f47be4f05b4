//! Error types for encoder backends and the backend registry

use thiserror::Error;

/// Errors reported by an [`EncoderBackend`](super::EncoderBackend)
///
/// Backends report per-frame problems (`SubmitRejected`) and hard device
/// problems (`DeviceLost`, `QueryFailed`) through the same type; the pipeline
/// decides which ones are fatal based on where they occur.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    // =========================================================================
    // Initialization Errors
    // =========================================================================
    /// Failed to initialize the encoder session
    #[error("Backend initialization failed: {0}")]
    InitFailed(String),

    /// The backend cannot encode the requested codec
    #[error("Codec '{codec}' not supported by backend")]
    UnsupportedCodec { codec: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// The backend has no such property
    #[error("Property not supported: {0}")]
    UnsupportedProperty(String),

    /// The backend refused a property value
    #[error("Invalid value for {property}: {reason}")]
    InvalidValue { property: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The backend refused a single frame
    #[error("Frame submission rejected: {0}")]
    SubmitRejected(String),

    /// The device disappeared (driver reset, GPU removed)
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Polling the device for output failed
    #[error("Output query failed: {0}")]
    QueryFailed(String),
}

impl BackendError {
    /// Errors that only affect the frame being submitted
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            BackendError::SubmitRejected(_)
                | BackendError::InvalidValue { .. }
                | BackendError::UnsupportedProperty(_)
        )
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors from the backend factory registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A factory with this name is already registered
    #[error("Backend factory '{name}' already registered")]
    AlreadyRegistered { name: String },

    /// The factory was never registered (or already removed)
    #[error("Backend factory '{name}' is not registered")]
    NotRegistered { name: String },

    /// The capability probe said the backend cannot run on this system
    #[error("Backend '{name}' is not available on this system")]
    Unavailable { name: String },

    /// The registry was shut down and accepts no more factories
    #[error("Backend registry has been shut down")]
    ShutDown,
}
