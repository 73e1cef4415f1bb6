//! Credential-store error types.
//!
//! The store distinguishes its failure modes so callers can tell a benign
//! "no such record" from a lock timeout or the one genuinely fatal case:
//! losing the authoritative store file after a failed replace.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by [`KeyStore`](super::KeyStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Username failed the `^\w+$` constraint.
    #[error("user name must only contain alphanumeric characters: {0:?}")]
    InvalidUserName(String),

    /// Key algorithm tag failed the allow-list grammar.
    #[error("unsupported key type: {0:?}")]
    InvalidKeyType(String),

    /// Key material is not strictly base64.
    #[error("invalid key value, expected base64-encoded string")]
    InvalidKeyEncoding,

    /// The advisory lock file could not be acquired.
    #[error("failed to lock credential store at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while reading, appending, or rewriting the store.
    #[error("credential store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The replacement rename failed and restoring the backup also failed.
    /// The store may be left without an authoritative file; manual
    /// intervention is required.  Never retried automatically.
    #[error(
        "FATAL: could not restore backup credential store at {path}; \
         manual intervention required: {source}"
    )]
    FatalRestore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remove completed its safe rewrite but matched no record.
    #[error("user key not found: {user}-{fingerprint}")]
    NotFound { user: String, fingerprint: String },
}

impl StoreError {
    /// True for the irrecoverable backup-restore failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::FatalRestore { .. })
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
