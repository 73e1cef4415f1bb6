//! Policy gateway: the boundary between a session and the operator's
//! authorization logic.
//!
//! The gateway holds no policy of its own.  The decision is delegated to an
//! external program resolved by filesystem path (normally through the
//! `.authorize` indirection link): the JSON-serialized [`AuthRequest`] is
//! written to the program's stdin, a zero exit status with a path on stdout
//! grants access, and a non-zero exit status denies it.  The returned path
//! is treated as trusted and handed to the dispatcher verbatim; whether it
//! exists is the transport tool's concern.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{bail, ensure, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::session::request::AuthRequest;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Capability interface over the authorization decision.  Invoked at most
/// once per session.
#[async_trait::async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Resolve `request` to the filesystem path of the target repository,
    /// or fail with the denial reason.
    async fn decide(&self, request: &AuthRequest) -> Result<PathBuf>;
}

// ---------------------------------------------------------------------------
// Exec implementation
// ---------------------------------------------------------------------------

/// The shipped [`AccessPolicy`]: an operator-supplied executable.
#[derive(Debug, Clone)]
pub struct ExecPolicy {
    program: PathBuf,
}

impl ExecPolicy {
    pub fn new(program: impl Into<PathBuf>) -> ExecPolicy {
        ExecPolicy {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl AccessPolicy for ExecPolicy {
    #[instrument(skip(self, request), fields(policy = %self.program.display(), repo = %request.repo))]
    async fn decide(&self, request: &AuthRequest) -> Result<PathBuf> {
        let payload = serde_json::to_vec(request).context("failed to serialize auth request")?;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!("failed to spawn policy program: {}", self.program.display())
            })?;

        // Write the request, then close stdin so the program sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("failed to write auth request to policy stdin")?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("policy program failed")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "access denied by policy (status {}): {}",
                output.status,
                stderr.trim(),
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout.lines().next().map(str::trim).unwrap_or_default();
        ensure!(
            !path.is_empty(),
            "policy granted access but returned no repository path"
        );

        debug!(path = %path, "policy granted access");
        Ok(PathBuf::from(path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
