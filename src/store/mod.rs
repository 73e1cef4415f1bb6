//! Durable, concurrency-safe credential store.
//!
//! Maps `(key-type, public-key, fingerprint, username)` to forced-command
//! directive lines in `<dir>/keys/authorized_keys`.  All mutation funnels
//! through an advisory lock file so independent administrative processes
//! never interleave, and removal uses a crash-safe three-phase replace.

pub mod error;
pub mod keys;
pub mod lock;

pub use error::StoreError;
pub use keys::{normalize_fingerprint, KeyStore, PublicKey, Record};
pub use lock::LockFile;
