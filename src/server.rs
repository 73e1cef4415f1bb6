//! Server lifecycle: provisioning a server directory and spawning the
//! external daemon.
//!
//! Provisioning is idempotent — directories, host keys, the sshd
//! configuration, the policy stub, the `.authorize` indirection link, and
//! the credential store are each created only when missing, so `configure`
//! can run before every `run` without disturbing an existing deployment.
//! Key generation and the daemon itself are external tools (`ssh-keygen`,
//! `sshd`); this module only spawns them.

use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::{self, KeyAlgo, Options};
use crate::store::KeyStore;

/// Deny-all policy installed when the operator has not supplied one yet.
const STUB_POLICY: &str = "\
#!/bin/sh
# Replace this with a real policy.  The JSON authorization request arrives
# on stdin; grant access by printing the repository path and exiting 0:
#   echo /path/to/repos/some.git
echo \"server missing authorization policy\" >&2
exit 1
";

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// One server directory plus its resolved runtime options.
#[derive(Debug)]
pub struct Server {
    dir: PathBuf,
    options: Options,
}

impl Server {
    /// Wrap a (possibly not yet provisioned) directory with explicit
    /// options.
    pub fn new(dir: &Path, options: Options) -> Result<Server> {
        config::validate_options(&options)?;
        Ok(Server {
            dir: std::path::absolute(dir)
                .with_context(|| format!("invalid server directory: {}", dir.display()))?,
            options,
        })
    }

    /// Reopen a configured directory, loading options from
    /// `<dir>/config.json`.
    pub fn open(dir: &Path) -> Result<Server> {
        let options = config::load_options(dir)?;
        Server::new(dir, options)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Credential-store handle bound to this directory's session command.
    pub fn store(&self) -> KeyStore {
        KeyStore::new(&self.dir, &self.options.command)
    }

    fn sshd_config_path(&self) -> PathBuf {
        self.dir.join("config")
    }

    // -----------------------------------------------------------------------
    // Provisioning
    // -----------------------------------------------------------------------

    /// Materialize the server directory: directories, host keys, daemon
    /// configuration, policy stub, indirection link, credential store, and
    /// the persisted options.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn configure(&mut self) -> Result<()> {
        for subdir in ["", "run", "keys"] {
            let path = self.dir.join(subdir);
            if path.is_dir() {
                debug!(path = %path.display(), "found directory");
                continue;
            }
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&path)
                .with_context(|| format!("failed to create directory: {}", path.display()))?;
            debug!(path = %path.display(), "created directory");
        }

        let wanted = self.resolve_key_algos();
        for algo in &wanted {
            if self.have_key_pair(*algo) {
                debug!(%algo, "using existing host key");
                continue;
            }
            self.generate_key_pair(*algo).await?;
        }
        self.options.keys = wanted;

        let config_path = self.sshd_config_path();
        if !config_path.exists() || self.options.overwrite {
            debug!(path = %config_path.display(), "writing daemon configuration");
            std::fs::write(&config_path, self.render_sshd_config()).with_context(|| {
                format!("failed to write daemon config: {}", config_path.display())
            })?;
        } else {
            debug!(path = %config_path.display(), "keeping existing daemon configuration");
        }

        self.ensure_policy_stub()?;
        self.refresh_policy_link()?;

        let store = self.store();
        store.ensure_exists()?;
        store.recover()?;

        config::save_options(&self.dir, &self.options)?;
        info!("server directory configured");
        Ok(())
    }

    /// Which host-key algorithms to provision: the configured set, else
    /// whatever pairs already exist, else all of them.
    fn resolve_key_algos(&self) -> Vec<KeyAlgo> {
        if !self.options.keys.is_empty() {
            return self.options.keys.clone();
        }
        let have: Vec<KeyAlgo> = KeyAlgo::ALL
            .into_iter()
            .filter(|algo| self.have_key_pair(*algo))
            .collect();
        if have.is_empty() {
            KeyAlgo::ALL.to_vec()
        } else {
            have
        }
    }

    fn key_file(&self, algo: KeyAlgo) -> PathBuf {
        self.dir.join("keys").join(algo.as_str())
    }

    fn have_key_pair(&self, algo: KeyAlgo) -> bool {
        let key = self.key_file(algo);
        let pub_key = key.with_extension("pub");
        key.is_file() && pub_key.is_file()
    }

    /// Generate one host key pair via the external key-generation tool.
    /// Inherits the terminal so the operator can answer its prompts.
    async fn generate_key_pair(&self, algo: KeyAlgo) -> Result<()> {
        let key_file = self.key_file(algo);
        info!(%algo, key = %key_file.display(), "generating host key");

        let status = Command::new("ssh-keygen")
            .arg("-t")
            .arg(algo.as_str())
            .arg("-f")
            .arg(&key_file)
            .status()
            .await
            .context("failed to spawn ssh-keygen")?;

        if !status.success() {
            bail!("ssh-keygen failed for {algo} (status {status})");
        }
        Ok(())
    }

    /// Render the daemon configuration consumed by the external sshd.
    fn render_sshd_config(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Port {}\n", self.options.port));
        for host in &self.options.hosts {
            out.push_str(&format!("ListenAddress {host}\n"));
        }
        for algo in &self.options.keys {
            out.push_str(&format!("HostKey {}\n", self.key_file(*algo).display()));
        }
        out.push_str(&format!(
            "PidFile {}\n",
            self.dir.join("run").join("sshd.pid").display()
        ));
        out.push_str(&format!(
            "AuthorizedKeysFile {}\n",
            self.dir.join("keys").join("authorized_keys").display()
        ));
        out.push_str(&format!("AllowUsers {}\n", self.options.user));
        out.push_str("PasswordAuthentication no\n");
        out.push_str("PubkeyAuthentication yes\n");
        out.push_str("StrictModes no\n");
        out
    }

    /// Install the deny-all stub if the configured policy program is absent.
    fn ensure_policy_stub(&self) -> Result<()> {
        let policy_file = self.options.policy_file(&self.dir);
        if policy_file.exists() {
            return Ok(());
        }
        debug!(path = %policy_file.display(), "installing stub policy");
        std::fs::write(&policy_file, STUB_POLICY)
            .with_context(|| format!("failed to write stub policy: {}", policy_file.display()))?;
        std::fs::set_permissions(&policy_file, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to chmod stub policy: {}", policy_file.display()))?;
        Ok(())
    }

    /// Point `<dir>/.authorize` at the configured policy program.  Directive
    /// lines reference the link, so relocating the policy only requires
    /// re-running `configure`.
    fn refresh_policy_link(&self) -> Result<()> {
        let link = self.dir.join(".authorize");
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link)
                .with_context(|| format!("failed to remove stale link: {}", link.display()))?;
        }
        let policy_file = self.options.policy_file(&self.dir);
        std::os::unix::fs::symlink(&policy_file, &link).with_context(|| {
            format!(
                "failed to link {} -> {}",
                link.display(),
                policy_file.display()
            )
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Daemon spawn
    // -----------------------------------------------------------------------

    /// Ensure the directory is configured, then start the external daemon.
    ///
    /// Foreground mode (`daemon == false`) passes `-De`, inherits the
    /// standard streams, waits, and propagates the daemon's exit status.
    /// Daemon mode spawns the child detached in its own process group and
    /// returns once it is running.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn run(&mut self, daemon: bool) -> Result<()> {
        self.configure().await?;

        let mut cmd = Command::new(&self.options.sshd);
        cmd.arg("-f").arg(self.sshd_config_path());

        if daemon {
            cmd.process_group(0)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            let child = cmd
                .spawn()
                .with_context(|| format!("failed to spawn {}", self.options.sshd.display()))?;
            info!(pid = child.id(), "daemon detached");
            Ok(())
        } else {
            cmd.arg("-De");
            let status = cmd
                .status()
                .await
                .with_context(|| format!("failed to spawn {}", self.options.sshd.display()))?;
            if !status.success() {
                bail!("sshd exited with status {status}");
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
