//! Per-connection session handling.
//!
//! The external sshd invokes the session entry point once per accepted
//! connection, with the identity baked into the matching directive line and
//! the client's requested command in `SSH_ORIGINAL_COMMAND`.  The flow is a
//! straight line: parse the untrusted command, build the authorization
//! request, consult the policy, dispatch the transport process.  Every
//! failure terminates this session's process with a diagnostic on stderr and
//! a non-zero exit; nothing here can affect the daemon.

pub mod dispatch;
pub mod request;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use crate::policy::AccessPolicy;

/// Environment variable the daemon stores the client's original command in
/// when a forced command overrides it.
pub const ORIGINAL_COMMAND_ENV: &str = "SSH_ORIGINAL_COMMAND";

/// Run one session to completion, reading the forced-command text from the
/// environment.  Returns the transport child's exit code.
pub async fn run(policy: &dyn AccessPolicy, username: &str, fingerprint: &str) -> Result<i32> {
    let raw = std::env::var(ORIGINAL_COMMAND_ENV)
        .map_err(|_| anyhow!("unsupported command: {ORIGINAL_COMMAND_ENV} is not set"))?;
    handle_command(policy, &raw, username, fingerprint).await
}

/// The session state machine, factored out of [`run`] so the command text
/// can be injected.
pub async fn handle_command(
    policy: &dyn AccessPolicy,
    raw: &str,
    username: &str,
    fingerprint: &str,
) -> Result<i32> {
    let Some(command) = request::parse_command(raw) else {
        // The raw string appears in the diagnostic only; it is never used
        // unescaped downstream.
        bail!("unsupported command: {raw}");
    };

    let auth_request = command.auth_request(username, fingerprint);
    let repo_path = policy
        .decide(&auth_request)
        .await
        .context("insufficient access rights")?;

    debug!(
        program = %command.program,
        repo = %command.repo,
        path = %repo_path.display(),
        "session authorized, dispatching"
    );
    dispatch::dispatch(&command.program, command.action, &repo_path).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordingPolicy {
        called: AtomicBool,
        outcome: std::result::Result<PathBuf, String>,
    }

    impl RecordingPolicy {
        fn granting(path: &str) -> Self {
            RecordingPolicy {
                called: AtomicBool::new(false),
                outcome: Ok(PathBuf::from(path)),
            }
        }

        fn denying(reason: &str) -> Self {
            RecordingPolicy {
                called: AtomicBool::new(false),
                outcome: Err(reason.to_string()),
            }
        }
    }

    #[async_trait::async_trait]
    impl AccessPolicy for RecordingPolicy {
        async fn decide(&self, _request: &request::AuthRequest) -> Result<PathBuf> {
            self.called.store(true, Ordering::SeqCst);
            match &self.outcome {
                Ok(path) => Ok(path.clone()),
                Err(reason) => Err(anyhow!("{reason}")),
            }
        }
    }

    #[tokio::test]
    async fn malformed_command_is_rejected_without_policy_invocation() {
        let policy = RecordingPolicy::granting("/srv/repos/a");

        let err = handle_command(&policy, "rm -rf /", "alice", "00ff")
            .await
            .unwrap_err();

        assert!(format!("{err}").contains("unsupported command: rm -rf /"));
        assert!(!policy.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn policy_denial_surfaces_without_dispatch() {
        let policy = RecordingPolicy::denying("read only for you");

        let err = handle_command(&policy, "git-receive-pack 'alice/repo'", "alice", "00ff")
            .await
            .unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("insufficient access rights"));
        assert!(message.contains("read only for you"));
        assert!(policy.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn grant_dispatches_with_the_policy_path() {
        // The "transport" here is the parsed operation name, so point PATH
        // at a directory providing a stub git-upload-pack.
        let dir = tempfile::tempdir().unwrap();
        let stub = dir.path().join("git-upload-pack");
        let capture = dir.path().join("args");
        std::fs::write(
            &stub,
            format!("#!/bin/sh\necho \"$@\" > {}\nexit 0\n", capture.display()),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let old_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{old_path}", dir.path().display()));

        let policy = RecordingPolicy::granting("/srv/repos/alice/repo");
        let code = handle_command(&policy, "git-upload-pack 'alice/repo'", "alice", "00ff")
            .await
            .unwrap();

        std::env::set_var("PATH", old_path);
        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(&capture).unwrap().trim(),
            "/srv/repos/alice/repo"
        );
    }
}
