//! Error types for elastic rendezvous

use thiserror::Error;

/// Main error type for rendezvous operations
#[derive(Error, Debug)]
pub enum RendezvousError {
    // ============ Configuration Errors ============
    #[error("The {field} timeout ({value}) must be positive.")]
    InvalidTimeout { field: &'static str, value: String },

    #[error("The minimum number of nodes ({0}) must be greater than zero.")]
    InvalidMinNodes(i64),

    #[error(
        "The maximum number of nodes ({max_nodes}) must be greater than or equal to \
         the minimum number of nodes ({min_nodes})."
    )]
    InvalidMaxNodes { min_nodes: i64, max_nodes: i64 },

    #[error("The {key} value ({value}) is not a valid {expected}.")]
    InvalidParameter {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // ============ Protocol Errors ============
    #[error(
        "The rendezvous '{run_id}' did not complete before the join timeout \
         ({participants} of {min_nodes} nodes present)."
    )]
    QuorumTimeout {
        run_id: String,
        participants: usize,
        min_nodes: usize,
    },

    #[error("The rendezvous '{run_id}' could not be closed before the close timeout.")]
    CloseTimeout { run_id: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("The rendezvous '{0}' is closed.")]
    Closed(String),

    #[error("The node {0} is not part of a completed rendezvous round.")]
    NotAParticipant(String),

    // ============ State Errors ============
    #[error("The rendezvous state is corrupt: {0}")]
    StateCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Message serialization failed: {0}")]
    SerializationError(String),

    // ============ General Errors ============
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RendezvousError {
    /// Returns true for the errors raised when a deadline elapses
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RendezvousError::QuorumTimeout { .. }
                | RendezvousError::CloseTimeout { .. }
                | RendezvousError::Timeout(_)
        )
    }

    /// Returns true for errors raised synchronously while validating configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            RendezvousError::InvalidTimeout { .. }
                | RendezvousError::InvalidMinNodes(_)
                | RendezvousError::InvalidMaxNodes { .. }
                | RendezvousError::InvalidParameter { .. }
                | RendezvousError::ConfigError(_)
        )
    }
}

impl From<std::io::Error> for RendezvousError {
    fn from(err: std::io::Error) -> Self {
        RendezvousError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for RendezvousError {
    fn from(err: bincode::Error) -> Self {
        RendezvousError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for RendezvousError {
    fn from(err: serde_json::Error) -> Self {
        RendezvousError::SerializationError(err.to_string())
    }
}
