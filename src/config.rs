//! Runtime options persisted to `<dir>/config.json`.
//!
//! The `config` subcommand resolves CLI flags into an [`Options`] value which
//! is written next to the generated sshd configuration.  Every later
//! invocation (`run`, `add-user`, `rm-user`) reloads the same file so that
//! the directive lines in the credential store keep pointing at a stable
//! session binary and policy path.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Host-key algorithms
// ---------------------------------------------------------------------------

/// Host-key algorithms the lifecycle manager knows how to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgo {
    Rsa,
    Dsa,
    Ecdsa,
}

impl KeyAlgo {
    /// All supported algorithms, in the order they are materialized on disk.
    pub const ALL: [KeyAlgo; 3] = [KeyAlgo::Rsa, KeyAlgo::Dsa, KeyAlgo::Ecdsa];

    /// The `ssh-keygen -t` name, which doubles as the key file name under
    /// `<dir>/keys/`.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgo::Rsa => "rsa",
            KeyAlgo::Dsa => "dsa",
            KeyAlgo::Ecdsa => "ecdsa",
        }
    }
}

impl std::fmt::Display for KeyAlgo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Resolved runtime options for one server directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Port the generated sshd configuration listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Addresses the daemon binds.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    /// The single system account allowed to authenticate.
    #[serde(default = "default_user")]
    pub user: String,
    /// Host-key algorithms to provision.  Empty means "decide at configure
    /// time": reuse whatever key pairs already exist, else generate all.
    #[serde(default)]
    pub keys: Vec<KeyAlgo>,
    /// Path to the sshd executable.
    #[serde(default = "default_sshd")]
    pub sshd: PathBuf,
    /// Path to the session entry-point binary embedded in directive lines.
    #[serde(default = "default_session_command")]
    pub command: PathBuf,
    /// Operator-supplied policy program.  `None` falls back to
    /// `<dir>/authorize`.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,
    /// Whether `configure()` rewrites an existing sshd config file.
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
}

fn default_port() -> u16 {
    2222
}

fn default_hosts() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "git".to_string())
}

fn default_sshd() -> PathBuf {
    PathBuf::from("/usr/bin/sshd")
}

fn default_session_command() -> PathBuf {
    // The session binary is installed next to the admin binary.
    std::env::current_exe()
        .ok()
        .and_then(|exe| Some(exe.parent()?.join("gitgate-session")))
        .unwrap_or_else(|| PathBuf::from("gitgate-session"))
}

fn default_overwrite() -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        Options {
            port: default_port(),
            hosts: default_hosts(),
            user: default_user(),
            keys: Vec::new(),
            sshd: default_sshd(),
            command: default_session_command(),
            auth_file: None,
            overwrite: default_overwrite(),
        }
    }
}

impl Options {
    /// The policy program the directive lines ultimately resolve to.
    pub fn policy_file(&self, dir: &Path) -> PathBuf {
        self.auth_file
            .clone()
            .unwrap_or_else(|| dir.join("authorize"))
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Path of the serialized options inside a server directory.
pub fn options_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

/// Load and validate [`Options`] from `<dir>/config.json`.
pub fn load_options(dir: &Path) -> Result<Options> {
    let path = options_path(dir);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read options file: {}", path.display()))?;
    let options: Options = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse options file: {}", path.display()))?;
    validate_options(&options)?;
    Ok(options)
}

/// Persist [`Options`] to `<dir>/config.json`.
pub fn save_options(dir: &Path, options: &Options) -> Result<()> {
    let path = options_path(dir);
    let contents = serde_json::to_string_pretty(options).context("failed to serialize options")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write options file: {}", path.display()))?;
    Ok(())
}

/// Sanity checks that cannot be expressed purely with serde.
pub fn validate_options(options: &Options) -> Result<()> {
    anyhow::ensure!(options.port != 0, "port must be non-zero");
    anyhow::ensure!(
        !options.hosts.is_empty(),
        "at least one listen address is required"
    );
    anyhow::ensure!(!options.user.is_empty(), "user must be non-empty");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
