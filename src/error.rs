//! Error types for Keystone
//!
//! Defines a unified error type that can represent failures from the store
//! layer, the attempt lifecycle and the cleanup subsystem, plus the
//! classification used to decide whether a failure is transient, a
//! convergence signal, or fatal to the attempt.

use std::fmt;

use crate::flags::FinalError;

/// Coarse classification of a failure, used by cleanup and accessor code to
/// decide between retry, treat-as-converged, and propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Document missing where one was expected. In cleanup paths this means
    /// someone else already converged the document.
    FailDocNotFound,
    /// Document already exists on an insert.
    FailDocAlreadyExists,
    /// CAS precondition failed; caller re-reads and retries, or treats the
    /// race as already-handled.
    FailCasMismatch,
    /// Sub-document path missing.
    FailPathNotFound,
    /// Sub-document path already exists.
    FailPathAlreadyExists,
    /// Attempt expired before reaching a terminal state.
    FailExpiry,
    /// Store temporarily unavailable; safe to retry.
    FailTransient,
    /// Anything else.
    FailOther,
}

/// Unified error type for Keystone operations
#[derive(Debug, Clone)]
pub enum KeystoneError {
    /// Document not found
    DocumentNotFound(String),
    /// Document already exists (insert collided)
    DocumentExists(String),
    /// CAS precondition failed
    CasMismatch(String),
    /// Sub-document path not found
    PathNotFound(String),
    /// Sub-document path already exists
    PathExists(String),
    /// Attempt expired
    AttemptExpired(String),
    /// Store-level failure (connectivity, timeout, server error)
    Store(String),
    /// Malformed document content (bad JSON shape in an ATR or client record)
    Decode(String),
    /// Transaction failed; carries the final error severity and enough
    /// context to locate the attempt's durable record.
    TransactionFailed {
        final_error: FinalError,
        attempt_id: String,
        atr_id: Option<String>,
    },
    /// Generic internal error
    Internal(String),
}

impl KeystoneError {
    /// Classify this error for retry/converge/propagate decisions.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            KeystoneError::DocumentNotFound(_) => ErrorClass::FailDocNotFound,
            KeystoneError::DocumentExists(_) => ErrorClass::FailDocAlreadyExists,
            KeystoneError::CasMismatch(_) => ErrorClass::FailCasMismatch,
            KeystoneError::PathNotFound(_) => ErrorClass::FailPathNotFound,
            KeystoneError::PathExists(_) => ErrorClass::FailPathAlreadyExists,
            KeystoneError::AttemptExpired(_) => ErrorClass::FailExpiry,
            KeystoneError::Store(_) => ErrorClass::FailTransient,
            _ => ErrorClass::FailOther,
        }
    }

    /// True for conditions that mean "the document already converged":
    /// cleanup paths swallow these rather than surfacing them.
    pub fn is_converged_signal(&self) -> bool {
        matches!(
            self.error_class(),
            ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound | ErrorClass::FailCasMismatch
        )
    }
}

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeystoneError::DocumentNotFound(key) => write!(f, "Document '{}' not found", key),
            KeystoneError::DocumentExists(key) => write!(f, "Document '{}' already exists", key),
            KeystoneError::CasMismatch(key) => write!(f, "CAS mismatch on '{}'", key),
            KeystoneError::PathNotFound(path) => write!(f, "Path '{}' not found", path),
            KeystoneError::PathExists(path) => write!(f, "Path '{}' already exists", path),
            KeystoneError::AttemptExpired(id) => write!(f, "Attempt '{}' expired", id),
            KeystoneError::Store(msg) => write!(f, "Store failure: {}", msg),
            KeystoneError::Decode(msg) => write!(f, "Decode failure: {}", msg),
            KeystoneError::TransactionFailed {
                final_error,
                attempt_id,
                atr_id,
            } => write!(
                f,
                "Transaction failed ({:?}) in attempt '{}' (atr: {})",
                final_error,
                attempt_id,
                atr_id.as_deref().unwrap_or("none")
            ),
            KeystoneError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for KeystoneError {}

impl From<serde_json::Error> for KeystoneError {
    fn from(e: serde_json::Error) -> Self {
        KeystoneError::Decode(e.to_string())
    }
}

/// Result type alias for Keystone operations
pub type Result<T> = std::result::Result<T, KeystoneError>;
