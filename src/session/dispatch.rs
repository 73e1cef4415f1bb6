//! Spawning of the authorized Git transport process.
//!
//! The dispatcher is the last stage of a session: by the time it runs, the
//! operation name has passed the command grammar and the repository path has
//! been resolved by the policy.  The child is placed in its own process
//! group but stays wired to the session's standard streams, so the pack
//! protocol flows transparently between the SSH client and the transport
//! tool.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::request::Action;

/// Extra guardrails for mutating operations: fail fast on malformed input
/// and do not let a stalled client hold repository locks open.
const WRITE_FLAGS: [&str; 2] = ["--strict", "--timeout=5"];

/// Spawn `program` against `repo_path` and stream the session's stdio
/// through it.  Returns the child's exit code once it terminates.
///
/// `read` operations receive exactly one argument, the path; `write`
/// operations get [`WRITE_FLAGS`] ahead of it.
#[instrument(fields(%program, path = %repo_path.display()))]
pub async fn dispatch(program: &str, action: Action, repo_path: &Path) -> Result<i32> {
    let mut cmd = Command::new(program);
    if action == Action::Write {
        cmd.args(WRITE_FLAGS);
    }
    cmd.arg(repo_path);

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Detach from the session's process group so a signal aimed at the
    // entry point does not tear the transport out from under the client.
    cmd.process_group(0);

    debug!("spawning transport process");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn transport process: {program}"))?;

    let mut child_stdin = child.stdin.take().expect("child stdin was set to piped");
    let mut child_stdout = child.stdout.take().expect("child stdout was set to piped");
    let mut child_stderr = child.stderr.take().expect("child stderr was set to piped");

    // Client → child.  Dropping the handle when the client closes its end
    // signals EOF so the transport knows negotiation is over.
    let stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
    });

    // Child → client, both streams.
    let stdout_task = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let _ = tokio::io::copy(&mut child_stdout, &mut stdout).await;
    });
    let stderr_task = tokio::spawn(async move {
        let mut stderr = tokio::io::stderr();
        let _ = tokio::io::copy(&mut child_stderr, &mut stderr).await;
    });

    let status = child.wait().await.context("transport process failed")?;

    // Drain whatever the child produced before it exited; the stdin pump may
    // still be parked on a client read and is simply dropped.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    stdin_task.abort();

    let code = status.code().unwrap_or(1);
    debug!(exit_code = code, "transport process finished");
    Ok(code)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
