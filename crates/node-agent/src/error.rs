use core::error::Error;

use error_stack::Report;

/// Result type used across the agent.
pub type AgentResult<T> = Result<T, Report<AgentError>>;

/// Errors surfaced by claim preparation and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AgentError {
    /// A collaborator required for the requested operation is not configured
    #[display("Configuration error: {message}")]
    Configuration { message: String },

    /// The request is malformed or not allowed for the device
    #[display("Invalid request: {message}")]
    Validation { message: String },

    /// MIG or VFIO backend failure
    #[display("Backend error: {message}")]
    Backend { message: String },

    /// CDI descriptor write or delete failure
    #[display("Device descriptor error: {message}")]
    Descriptor { message: String },

    /// Checkpoint load or save failure
    #[display("Checkpoint persistence error: {message}")]
    Persistence { message: String },

    /// The stored checkpoint contradicts itself
    #[display("Checkpoint data integrity error: {message}")]
    DataIntegrity { message: String },

    #[display("Node lock error: {message}")]
    Lock { message: String },

    #[display("Operation cancelled: {message}")]
    Cancelled { message: String },
}

impl Error for AgentError {}

impl AgentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity {
            message: message.into(),
        }
    }

    pub fn lock(message: impl Into<String>) -> Self {
        Self::Lock {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }
}

