//! Error types for PAC operations.
//!
//! Every fallible operation in the authentication core returns
//! [`PacResult`]. The error set is closed: callers (CLI, status
//! servers, collaborator shims) match on it exhaustively.

use thiserror::Error;

/// Result type alias for PAC operations.
pub type PacResult<T> = Result<T, PacError>;

/// Errors that can occur in the authentication core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacError {
    /// Generic operational failure; logged at the point of origin,
    /// caller may retry.
    #[error("operation failed: {message}")]
    Failure {
        /// What failed.
        message: String,
    },

    /// A precondition was not met (e.g. max-users change outside
    /// multi-auth host mode, priority demotion).
    #[error("request denied: {message}")]
    RequestDenied {
        /// Which precondition failed.
        message: String,
    },

    /// Referenced VLAN / interface / client does not exist.
    #[error("{entity} not found")]
    NotExist {
        /// The missing entity.
        entity: String,
    },

    /// Logical-port pool is full on the port.
    #[error("client limit reached on port {port}")]
    CapacityExceeded {
        /// Physical port number.
        port: u32,
    },

    /// Argument out of range (VLAN outside [1,4094], unknown mode
    /// value).
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// The offending argument.
        message: String,
    },

    /// Lock acquisition timed out.
    #[error("resource busy: {resource}")]
    Busy {
        /// The contended resource.
        resource: String,
    },
}

impl PacError {
    /// Creates a generic failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    /// Creates a request-denied error.
    pub fn denied(message: impl Into<String>) -> Self {
        Self::RequestDenied {
            message: message.into(),
        }
    }

    /// Creates a not-exist error.
    pub fn not_exist(entity: impl Into<String>) -> Self {
        Self::NotExist {
            entity: entity.into(),
        }
    }

    /// Creates an invalid-parameter error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a busy error.
    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
        }
    }

    /// Process exit code when the error surfaces through a CLI:
    /// 1 generic failure, 2 invalid parameter, 3 request denied.
    /// Success is the Ok path and maps to 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            PacError::InvalidParameter { .. } => 2,
            PacError::RequestDenied { .. } => 3,
            _ => 1,
        }
    }

    /// Returns true if the condition is transient and the same call
    /// may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PacError::Failure { .. } | PacError::Busy { .. })
    }
}
