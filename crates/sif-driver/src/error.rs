//! Error types for SIF driver operations

use thiserror::Error;

/// Result type alias for SIF operations
pub type Result<T> = std::result::Result<T, SifError>;

/// Errors that can occur during SIF operations
#[derive(Debug, Error)]
pub enum SifError {
    /// Caller passed something the protocol cannot carry
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// DMA memory could not be allocated or mapped
    #[error("Resource exhausted: {reason}")]
    ResourceExhausted {
        /// What ran out
        reason: String,
    },

    /// A channel or client did not become ready within its budget
    #[error("{what} busy after {duration_ms}ms")]
    Busy {
        /// Resource that stayed busy
        what: &'static str,
        /// Budget that elapsed in milliseconds
        duration_ms: u64,
    },

    /// A bounded wait expired
    #[error("{what} timed out after {duration_ms}ms")]
    Timeout {
        /// Operation that timed out
        what: &'static str,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Handshake failed or the IOP reported failure
    #[error("I/O error: {reason}")]
    Io {
        /// Reason for failure
        reason: String,
    },

    /// Operation not valid in the current state
    #[error("Invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Protocol integrity is lost; the operation must not continue
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Violated invariant
        reason: String,
    },

    /// Operating-system error (device node, mmap)
    #[error("OS error: {source}")]
    Os {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl SifError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(reason: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            reason: reason.into(),
        }
    }

    /// Create an I/O error
    pub fn io(reason: impl Into<String>) -> Self {
        Self::Io {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a protocol violation
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Map a negative status reported by an IOP service.
    ///
    /// Every negative status becomes a generic I/O error. Non-negative status
    /// is success and yields `None`.
    pub fn from_remote_status(what: &str, status: i32) -> Option<Self> {
        (status < 0).then(|| Self::io(format!("{what}: IOP reported status {status}")))
    }

    /// Fatal errors mean the interconnect can no longer be trusted
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }

    /// Errors a caller may reasonably retry
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Timeout { .. })
    }
}
