//! Error types for the audit pipeline
//!
//! The taxonomy separates failures the queue should retry (transient storage)
//! from failures that must be surfaced and never retried (validation,
//! integrity, configuration).

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using the pipeline error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the audit pipeline
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Required configuration is missing or inconsistent (fatal at startup)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed event or draft, rejected before publication or persistence
    #[error("Validation error: {0}")]
    Validation(String),

    /// Storage write or read failed in a way that may succeed on retry
    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    /// Storage failed permanently (constraint violation, decode error)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Signature verification mismatch
    #[error("Integrity violation for audit log {log_id}: {reason}")]
    IntegrityViolation {
        /// Log whose integrity check failed
        log_id: Uuid,
        /// What did not match
        reason: IntegrityFailure,
    },

    /// JWT encoding or decoding error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// A named queue processor or event handler was registered twice
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Queue refused or lost a job
    #[error("Queue error: {0}")]
    Queue(String),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retriable (transient errors that may succeed on retry)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::TransientStorage(_) | Error::Queue(_) | Error::Io(_)
        )
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Create an integrity violation
    pub fn integrity(log_id: Uuid, reason: IntegrityFailure) -> Self {
        Error::IntegrityViolation { log_id, reason }
    }
}

/// Why an integrity check failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// The token's signature did not validate against the signing key
    InvalidToken(String),
    /// The token is bound to a different log id
    IdMismatch {
        /// Id carried by the token
        token_id: String,
    },
    /// The stored content no longer hashes to the signed value
    HashMismatch,
    /// No signature was stored for the log
    MissingSignature,
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidToken(msg) => write!(f, "invalid token: {}", msg),
            Self::IdMismatch { token_id } => {
                write!(f, "token bound to a different log id ({})", token_id)
            }
            Self::HashMismatch => write!(f, "content hash mismatch"),
            Self::MissingSignature => write!(f, "no signature stored"),
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}

// Classify sqlx failures into transient (retry) and permanent storage errors
#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;
        match err {
            E::PoolTimedOut => Error::TransientStorage("Connection pool timed out".to_string()),
            E::PoolClosed => Error::TransientStorage("Connection pool is closed".to_string()),
            E::Io(e) => Error::TransientStorage(format!("I/O error: {}", e)),
            E::Tls(e) => Error::TransientStorage(format!("TLS error: {}", e)),
            E::WorkerCrashed => Error::TransientStorage("Database worker crashed".to_string()),
            E::Database(db_err) => {
                // Constraint violations will fail again on retry
                if db_err.is_unique_violation()
                    || db_err.is_foreign_key_violation()
                    || db_err.is_check_violation()
                {
                    Error::Storage(db_err.to_string())
                } else {
                    Error::TransientStorage(db_err.to_string())
                }
            }
            E::RowNotFound => Error::NotFound("Row not found".to_string()),
            E::ColumnDecode { index, source } => {
                Error::Storage(format!("Failed to decode column {}: {}", index, source))
            }
            E::Decode(e) => Error::Storage(e.to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retriable_transient_errors() {
        assert!(Error::TransientStorage("timeout".into()).is_retriable());
        assert!(Error::Queue("closed".into()).is_retriable());
    }

    #[test]
    fn test_is_retriable_permanent_errors() {
        assert!(!Error::Validation("missing operation_type".into()).is_retriable());
        assert!(!Error::Storage("unique violation".into()).is_retriable());
        assert!(!Error::Configuration("no key".into()).is_retriable());
        assert!(!Error::integrity(Uuid::nil(), IntegrityFailure::HashMismatch).is_retriable());
    }

    #[test]
    fn test_display_formatting() {
        let err = Error::integrity(Uuid::nil(), IntegrityFailure::HashMismatch);
        assert_eq!(
            err.to_string(),
            "Integrity violation for audit log 00000000-0000-0000-0000-000000000000: content hash mismatch"
        );

        let err = Error::validation("affected_entity is required");
        assert_eq!(err.to_string(), "Validation error: affected_entity is required");
    }

    #[test]
    fn test_integrity_failure_display() {
        let failure = IntegrityFailure::IdMismatch {
            token_id: "abc".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "token bound to a different log id (abc)"
        );
        assert_eq!(
            IntegrityFailure::MissingSignature.to_string(),
            "no signature stored"
        );
    }
}
