//! The DriftFS error taxonomy
//!
//! Every subsystem classifies failures with [`DriftError`]. The kind
//! distinction drives retry policy, offline detection, and conflict
//! handling, so it is never collapsed into an opaque error type at
//! subsystem boundaries.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a [`DriftError`]
///
/// Used where only the category matters (retry decisions, metrics labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Auth,
    NotFound,
    Conflict,
    RateLimited,
    Server,
    Validation,
    Storage,
    Config,
    Cancelled,
    Filesystem,
}

/// Typed errors produced by the DriftFS core
#[derive(Debug, Error, Clone)]
pub enum DriftError {
    /// Connectivity failure; feeds passive offline detection
    #[error("network error: {0}")]
    Network(String),

    /// Token invalid or expired after a refresh attempt
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Item absent on the remote store
    #[error("not found: {0}")]
    NotFound(String),

    /// ETag / version mismatch between local and remote
    #[error("conflict: {0}")]
    Conflict(String),

    /// Remote throttling; `retry_after` carries the server hint when present
    #[error("rate limited")]
    RateLimited {
        /// Server-provided `Retry-After` hint
        retry_after: Option<Duration>,
    },

    /// Transient remote failure (HTTP 5xx)
    #[error("server error (status {status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        message: String,
    },

    /// Checksum mismatch, malformed response, or invalid domain value
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid item state transition attempt
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Persistent store lock could not be acquired
    #[error("storage locked: {0}")]
    StorageLocked(String),

    /// Persistent store is unreadable; fatal at mount
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// Invalid configuration value; names the field and the valid range
    #[error("invalid configuration for {field}: {message}")]
    Config { field: String, message: String },

    /// Cooperative cancellation
    #[error("operation cancelled")]
    Cancelled,

    // --- Filesystem-surface codes (vfs contract) ---
    /// Directory removal attempted on a non-empty directory
    #[error("directory not empty")]
    NotEmpty,

    /// Directory operation on a file node
    #[error("not a directory")]
    NotADirectory,

    /// File operation on a directory node
    #[error("is a directory")]
    IsADirectory,

    /// Name rejected by the filesystem surface (empty, contains '/', ...)
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl DriftError {
    /// Returns the coarse classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriftError::Network(_) => ErrorKind::Network,
            DriftError::Auth(_) => ErrorKind::Auth,
            DriftError::NotFound(_) => ErrorKind::NotFound,
            DriftError::Conflict(_) => ErrorKind::Conflict,
            DriftError::RateLimited { .. } => ErrorKind::RateLimited,
            DriftError::Server { .. } => ErrorKind::Server,
            DriftError::Validation(_) | DriftError::InvalidTransition { .. } => {
                ErrorKind::Validation
            }
            DriftError::StorageLocked(_) | DriftError::StorageCorrupt(_) => ErrorKind::Storage,
            DriftError::Config { .. } => ErrorKind::Config,
            DriftError::Cancelled => ErrorKind::Cancelled,
            DriftError::NotEmpty
            | DriftError::NotADirectory
            | DriftError::IsADirectory
            | DriftError::InvalidName(_) => ErrorKind::Filesystem,
        }
    }

    /// Returns true for kinds that pipelines retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::RateLimited | ErrorKind::Server
        )
    }

    /// Returns the server-provided backoff hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DriftError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Returns true for store failures that must halt the mount
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Storage | ErrorKind::Config)
    }
}
