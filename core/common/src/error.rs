//! Common error types for Eaves.

use thiserror::Error;

/// Numeric error codes shared with the remote service.
pub mod codes {
    /// Internal server error.
    pub const INTERNAL_SERVER: i64 = 1;
    /// The connection to the remote service failed.
    pub const CONNECTION_FAILED: i64 = 100;
    /// Object doesn't exist on the remote service.
    pub const OBJECT_NOT_FOUND: i64 = 101;
    /// Malformed query.
    pub const INVALID_QUERY: i64 = 102;
    /// Missing or invalid class name.
    pub const INVALID_CLASS_NAME: i64 = 103;
    /// Missing object id.
    pub const MISSING_OBJECT_ID: i64 = 104;
    /// Operation isn't allowed for clients.
    pub const OPERATION_FORBIDDEN: i64 = 119;
    /// The results were not found in the cache.
    pub const CACHE_MISS: i64 = 120;
    /// Invalid ACL document.
    pub const INVALID_ACL: i64 = 123;
    /// The request timed out.
    pub const TIMEOUT: i64 = 124;
    /// A unique field was given a value that is already taken.
    pub const DUPLICATE_VALUE: i64 = 137;
    /// Validation rejected by the remote service.
    pub const VALIDATION_FAILED: i64 = 142;
    /// Session token is invalid or revoked.
    pub const INVALID_SESSION_TOKEN: i64 = 209;
    /// Local-only failures (storage, serialization, integrity, cancellation).
    pub const LOCAL_FAILURE: i64 = -1;
}

/// Top-level error type for Eaves operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A cache-only or exhausted-fallback lookup found nothing.
    #[error("Cache miss: {0}")]
    CacheMiss(String),

    /// Malformed ACL rejected locally or by the remote service.
    #[error("Invalid ACL: {0}")]
    InvalidAcl(String),

    /// Permission denied by local ACL evaluation or by token rejection.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unique constraint violation on save.
    #[error("Duplicate value: {0}")]
    DuplicateValue(String),

    /// The remote service no longer has the requested object.
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Transient connectivity failure.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Transient timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Permanent validation rejection from the remote service.
    #[error("Validation rejected: {0}")]
    ValidationRejected(String),

    /// Any other structured error returned by the remote service.
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    /// Partial write detected in the local datastore.
    #[error("Datastore integrity violation: {0}")]
    Integrity(String),

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation was cancelled before completion.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build an error from a numeric code reported by the remote service.
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::CONNECTION_FAILED => Error::ConnectionFailed(message),
            codes::OBJECT_NOT_FOUND => Error::ObjectNotFound(message),
            codes::CACHE_MISS => Error::CacheMiss(message),
            codes::INVALID_ACL => Error::InvalidAcl(message),
            codes::TIMEOUT => Error::Timeout(message),
            codes::DUPLICATE_VALUE => Error::DuplicateValue(message),
            codes::VALIDATION_FAILED => Error::ValidationRejected(message),
            codes::OPERATION_FORBIDDEN | codes::INVALID_SESSION_TOKEN => {
                Error::Unauthorized(message)
            }
            _ => Error::Remote { code, message },
        }
    }

    /// Numeric code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Error::CacheMiss(_) => codes::CACHE_MISS,
            Error::InvalidAcl(_) => codes::INVALID_ACL,
            Error::Unauthorized(_) => codes::INVALID_SESSION_TOKEN,
            Error::DuplicateValue(_) => codes::DUPLICATE_VALUE,
            Error::ObjectNotFound(_) => codes::OBJECT_NOT_FOUND,
            Error::ConnectionFailed(_) => codes::CONNECTION_FAILED,
            Error::Timeout(_) => codes::TIMEOUT,
            Error::ValidationRejected(_) => codes::VALIDATION_FAILED,
            Error::Remote { code, .. } => *code,
            _ => codes::LOCAL_FAILURE,
        }
    }

    /// Whether retrying the same request may succeed.
    ///
    /// Only transient transport conditions qualify. Remote rejections with a
    /// structured code are permanent, except internal server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectionFailed(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Remote { code, .. } => *code == codes::INTERNAL_SERVER,
            _ => false,
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
