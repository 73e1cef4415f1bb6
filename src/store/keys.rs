//! The credential store: a line-oriented `authorized_keys` file mapping
//! public keys to named users.
//!
//! Each record is one forced-command directive line.  The line pins the
//! session entry point, the policy indirection link, the username, and the
//! key fingerprint, so the external sshd performs the per-connection lookup
//! itself; the store is only ever mutated out-of-band by administrative
//! add/remove operations, serialized across processes by the sibling lock
//! file.
//!
//! Removal rewrites the file through a `.new` sibling and swaps it into
//! place with a three-phase replace (hard-link `.bak`, unlink the original,
//! rename `.new`).  A crash between phases leaves either the original, or a
//! restorable backup, or the finished replacement on disk.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use base64::Engine as _;
use md5::{Digest, Md5};
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::error::{Result, StoreError};
use super::lock::LockFile;

// ---------------------------------------------------------------------------
// Validation grammars
// ---------------------------------------------------------------------------

static USER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").unwrap());

static ALGO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[-+a-zA-Z]+$").unwrap());

static BASE64_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?$").unwrap()
});

// ---------------------------------------------------------------------------
// Public keys
// ---------------------------------------------------------------------------

/// One public key as it appears in an OpenSSH public-key file:
/// `<algorithm> <base64-material> [comment]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Algorithm tag, e.g. `ssh-rsa` or `ecdsa-sha2-nistp256`.
    pub algo: String,
    /// Base64-encoded key material.
    pub material: String,
}

impl PublicKey {
    /// Parse the first line of a public-key file.  The trailing comment, if
    /// any, is discarded.
    pub fn parse(line: &str) -> Result<PublicKey> {
        let mut parts = line.split_whitespace();
        let algo = parts.next().ok_or(StoreError::InvalidKeyEncoding)?;
        let material = parts.next().ok_or(StoreError::InvalidKeyEncoding)?;
        Ok(PublicKey {
            algo: algo.to_string(),
            material: material.to_string(),
        })
    }

    /// Validate the algorithm tag and key-material grammar.
    pub fn validate(&self) -> Result<()> {
        if !ALGO_RE.is_match(&self.algo) {
            return Err(StoreError::InvalidKeyType(self.algo.clone()));
        }
        if !BASE64_RE.is_match(&self.material) {
            return Err(StoreError::InvalidKeyEncoding);
        }
        Ok(())
    }

    /// Fingerprint of the decoded key material: MD5, lowercase hex, no
    /// separators.  This is the stable identity a record is removed by and
    /// the value bound into its directive line.
    pub fn fingerprint(&self) -> Result<String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.material.as_bytes())
            .map_err(|_| StoreError::InvalidKeyEncoding)?;
        Ok(hex::encode(Md5::digest(&raw)))
    }
}

/// Strip colon separators and fold a user-supplied fingerprint to the
/// canonical lowercase-hex form.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.replace(':', "").to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Identity parsed back out of a directive line's trailing
/// `<username>-<fingerprint>` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub user: String,
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle on one server directory's credential store.
///
/// Cheap to construct; every operation opens, locks, and releases the
/// underlying files itself, so independent processes holding their own
/// `KeyStore` values cooperate correctly.
#[derive(Debug, Clone)]
pub struct KeyStore {
    store_path: PathBuf,
    lock_path: PathBuf,
    session_command: PathBuf,
    policy_link: PathBuf,
}

impl KeyStore {
    /// Store handle for a configured server directory, binding directive
    /// lines to `session_command`.
    pub fn new(dir: &Path, session_command: &Path) -> KeyStore {
        KeyStore {
            store_path: dir.join("keys").join("authorized_keys"),
            lock_path: dir.join("run").join("authorized_keys.lock"),
            session_command: session_command.to_path_buf(),
            policy_link: dir.join(".authorize"),
        }
    }

    /// The store file itself.
    pub fn path(&self) -> &Path {
        &self.store_path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.store_path.clone(),
            source,
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .store_path
            .file_name()
            .expect("store path has a file name")
            .to_os_string();
        name.push(suffix);
        self.store_path.with_file_name(name)
    }

    // -----------------------------------------------------------------------
    // Directive formatting
    // -----------------------------------------------------------------------

    /// Format the forced-command directive line for one record.
    fn directive_line(&self, username: &str, key: &PublicKey, fingerprint: &str) -> String {
        format!(
            "command=\"{} {} {} {}\",no-port-forwarding,no-X11-forwarding,\
             no-agent-forwarding,no-pty {} {} {}-{}\n",
            self.session_command.display(),
            self.policy_link.display(),
            username,
            fingerprint,
            key.algo,
            key.material,
            username,
            fingerprint,
        )
    }

    // -----------------------------------------------------------------------
    // Add
    // -----------------------------------------------------------------------

    /// Append a record for `(username, key)`.  Returns the derived
    /// fingerprint.
    ///
    /// Duplicate adds are tolerated and produce multiple lines; the store is
    /// append-only history until a remove rewrites it.
    pub fn add(&self, username: &str, key: &PublicKey) -> Result<String> {
        if !USER_RE.is_match(username) {
            return Err(StoreError::InvalidUserName(username.to_string()));
        }
        key.validate()?;
        let fingerprint = key.fingerprint()?;
        let line = self.directive_line(username, key, &fingerprint);

        let _lock = LockFile::acquire(&self.lock_path)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&self.store_path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| self.io_err(e))?;
        file.flush().map_err(|e| self.io_err(e))?;

        info!(user = username, fingerprint = %fingerprint, "added credential record");
        Ok(fingerprint)
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    /// Remove every record whose trailing token is
    /// `<username>-<fingerprint>`.
    ///
    /// The store is streamed through a filtered `.new` sibling and swapped
    /// into place even when nothing matches; absence of a match is reported
    /// as [`StoreError::NotFound`] only after the safe rewrite completed.
    pub fn remove(&self, username: &str, fingerprint: &str) -> Result<()> {
        let fingerprint = normalize_fingerprint(fingerprint);
        let needle = format!("{username}-{fingerprint}");
        debug!(user = username, fingerprint = %fingerprint, "removing credential record");

        let _lock = LockFile::acquire(&self.lock_path)?;
        let staging = self.sibling(".new");

        let removed = match self.rewrite_filtered(&staging, &needle) {
            Ok(removed) => removed,
            Err(err) => {
                let _ = std::fs::remove_file(&staging);
                return Err(err);
            }
        };

        if let Err(err) = self.replace_store(&staging) {
            let _ = std::fs::remove_file(&staging);
            return Err(err);
        }

        if !removed {
            return Err(StoreError::NotFound {
                user: username.to_string(),
                fingerprint,
            });
        }
        info!(user = username, fingerprint = %fingerprint, "removed credential record");
        Ok(())
    }

    /// Stream the store line-by-line into `staging`, dropping lines whose
    /// trailing token equals `needle`.  Every surviving line is copied
    /// verbatim.  Returns whether anything was dropped.
    fn rewrite_filtered(&self, staging: &Path, needle: &str) -> Result<bool> {
        let source = std::fs::File::open(&self.store_path).map_err(|e| self.io_err(e))?;
        let reader = BufReader::new(source);
        let out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(staging)
            .map_err(|e| self.io_err(e))?;
        let mut writer = BufWriter::new(out);

        let mut removed = false;
        for line in reader.lines() {
            let line = line.map_err(|e| self.io_err(e))?;
            if line.split(' ').next_back() == Some(needle) {
                removed = true;
                continue;
            }
            writer.write_all(line.as_bytes()).map_err(|e| self.io_err(e))?;
            writer.write_all(b"\n").map_err(|e| self.io_err(e))?;
        }
        writer.flush().map_err(|e| self.io_err(e))?;
        Ok(removed)
    }

    /// The three-phase replace: hard-link the original to `.bak`, unlink the
    /// original, rename `staging` into place, then drop the backup.
    ///
    /// If the rename fails the backup is renamed back; if that restoration
    /// also fails the store has no authoritative file and the error is the
    /// distinct fatal variant — reported loudly, never retried.
    fn replace_store(&self, staging: &Path) -> Result<()> {
        let backup = self.sibling(".bak");

        debug!(backup = %backup.display(), "backing up credential store");
        std::fs::hard_link(&self.store_path, &backup).map_err(|e| self.io_err(e))?;
        std::fs::remove_file(&self.store_path).map_err(|e| self.io_err(e))?;

        match std::fs::rename(staging, &self.store_path) {
            Ok(()) => {
                std::fs::remove_file(&backup).map_err(|e| self.io_err(e))?;
                Ok(())
            }
            Err(rename_err) => {
                warn!(error = %rename_err, "replacement rename failed, restoring backup");
                match std::fs::rename(&backup, &self.store_path) {
                    Ok(()) => Err(self.io_err(rename_err)),
                    Err(restore_err) => {
                        error!(
                            store = %self.store_path.display(),
                            error = %restore_err,
                            "FATAL: could not restore backup credential store; \
                             manual intervention required"
                        );
                        Err(StoreError::FatalRestore {
                            path: self.store_path.clone(),
                            source: restore_err,
                        })
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// Parse the trailing identity token of every directive line.  A missing
    /// store file reads as empty.  Lock-free: readers tolerate concurrent
    /// appends because records are whole lines.
    pub fn scan(&self) -> Result<Vec<Record>> {
        let contents = match std::fs::read_to_string(&self.store_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_err(err)),
        };

        let mut records = Vec::new();
        for line in contents.lines() {
            let Some(token) = line.split(' ').next_back() else {
                continue;
            };
            if let Some((user, fingerprint)) = token.rsplit_once('-') {
                records.push(Record {
                    user: user.to_string(),
                    fingerprint: fingerprint.to_string(),
                });
            }
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Create the store file (mode 0600) if absent.  An existing store is
    /// preserved untouched.
    pub fn ensure_exists(&self) -> Result<()> {
        OpenOptions::new()
            .append(true)
            .create(true)
            .mode(0o600)
            .open(&self.store_path)
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Heal leftovers of an interrupted replace, under the lock.
    ///
    /// If the store file exists it is authoritative: stale `.bak`/`.new`
    /// siblings are dropped.  If it is missing but a `.bak` survives, the
    /// backup is renamed back into place.  Runs during provisioning only.
    pub fn recover(&self) -> Result<()> {
        let _lock = LockFile::acquire(&self.lock_path)?;
        let backup = self.sibling(".bak");
        let staging = self.sibling(".new");

        if self.store_path.exists() {
            if backup.exists() {
                warn!(backup = %backup.display(), "dropping stale store backup");
                std::fs::remove_file(&backup).map_err(|e| self.io_err(e))?;
            }
        } else if backup.exists() {
            warn!(
                store = %self.store_path.display(),
                "credential store missing, restoring from backup"
            );
            std::fs::rename(&backup, &self.store_path).map_err(|e| self.io_err(e))?;
        }

        if staging.exists() {
            warn!(staging = %staging.display(), "dropping stale store staging file");
            std::fs::remove_file(&staging).map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
