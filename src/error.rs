//! Crate-wide error taxonomy
//!
//! Every failure surfaced by the engine is mapped into one of these kinds
//! before a command future completes. The taxonomy distinguishes:
//! - Non-retryable caller mistakes (invalid argument, not found, conflict)
//! - Transient persistence failures that feed the retry policy
//! - Terminal failures that exhausted retries and were routed to the DLQ
//! - Integrity violations detected by audit-chain verification

use thiserror::Error;

/// Errors produced by the access control engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcsError {
    /// Malformed input: empty name, non-positive id, unknown kind
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced principal, resource, verb, or scheme does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate name, cycle introduction, or similar constraint violation
    #[error("conflict: {reason} (hint: {hint})")]
    Conflict {
        /// What the command collided with
        reason: String,
        /// Remediation hint for the caller
        hint: String,
    },

    /// Command kind not handled by this engine
    #[error("unsupported command: {0}")]
    Unsupported(String),

    /// Persistence failure expected to succeed on retry
    #[error("transient persistence failure: {0}")]
    Transient(String),

    /// Transient failure that exhausted the retry budget
    #[error("terminal failure after {attempts} attempts: {message}")]
    Terminal {
        /// Number of attempts made before giving up
        attempts: u32,
        /// The last underlying error
        message: String,
    },

    /// Divergence between the in-memory graph and the store, or a broken
    /// audit chain
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Command cancelled before execution or rejected during shutdown
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Surfaced immediately, never retried
    NonRetryable,
    /// Retried with exponential backoff
    Transient,
    /// Exhausted retries, routed to the DLQ
    Terminal,
    /// Fatal inconsistency, reported and never retried
    Integrity,
}

impl AcsError {
    /// Classify this error for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            AcsError::InvalidArgument(_)
            | AcsError::NotFound(_)
            | AcsError::Conflict { .. }
            | AcsError::Unsupported(_)
            | AcsError::Cancelled(_) => ErrorClass::NonRetryable,
            AcsError::Transient(_) => ErrorClass::Transient,
            AcsError::Terminal { .. } => ErrorClass::Terminal,
            AcsError::Integrity(_) => ErrorClass::Integrity,
        }
    }

    /// Whether the retry policy may re-attempt the failed operation
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Conflict constructor with a remediation hint
    pub fn conflict(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        AcsError::Conflict {
            reason: reason.into(),
            hint: hint.into(),
        }
    }
}

/// Result type for engine operations
pub type AcsResult<T> = Result<T, AcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            AcsError::InvalidArgument("x".into()).class(),
            ErrorClass::NonRetryable
        );
        assert_eq!(
            AcsError::Transient("timeout".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            AcsError::Terminal {
                attempts: 3,
                message: "timeout".into()
            }
            .class(),
            ErrorClass::Terminal
        );
        assert!(AcsError::Transient("x".into()).is_retryable());
        assert!(!AcsError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_conflict_hint_in_message() {
        let err = AcsError::conflict("group cycle", "remove the existing edge first");
        assert!(err.to_string().contains("hint"));
        assert!(err.to_string().contains("group cycle"));
    }
}
