//! Advisory lock file guarding credential-store mutation.
//!
//! The lock is a sibling file created with `O_EXCL`: whichever process wins
//! the exclusive create holds the lock, everyone else polls until the file
//! disappears or the wait window runs out.  This serializes add/remove across
//! independent OS processes without relying on kernel `flock` semantics, so
//! any cooperating tool that honors the same lock path participates.
//!
//! The guard removes the lock file on drop, including on error unwinds, so
//! release is unconditional.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::{Result, StoreError};

/// Default total time a waiter will poll for the lock.
const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Interval between exclusive-create attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Held advisory lock.  Dropping the guard releases the lock.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, polling for up to the default wait window.
    pub fn acquire(path: &Path) -> Result<LockFile> {
        Self::acquire_timeout(path, DEFAULT_WAIT)
    }

    /// Acquire the lock at `path`, polling for up to `wait`.
    pub fn acquire_timeout(path: &Path, wait: Duration) -> Result<LockFile> {
        let deadline = Instant::now() + wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Record the holder's pid for post-mortem diagnosis of a
                    // stale lock.  Failure to write it does not invalidate
                    // the lock itself.
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!(lock = %path.display(), "acquired store lock");
                    return Ok(LockFile {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Lock {
                            path: path.to_path_buf(),
                            source: std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "lock held by another process",
                            ),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    return Err(StoreError::Lock {
                        path: path.to_path_buf(),
                        source: err,
                    });
                }
            }
        }
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            // Leaves a stale lock behind; the next waiter will time out and
            // report it rather than deadlock silently.
            warn!(
                lock = %self.path.display(),
                error = %err,
                "failed to release store lock"
            );
        } else {
            debug!(lock = %self.path.display(), "released store lock");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
