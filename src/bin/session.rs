//! Forced-command session entry point.
//!
//! The external sshd invokes this binary for every accepted connection, with
//! the identity bound by the matching directive line:
//!
//! ```text
//! gitgate-session <policy-file> <username> <fingerprint>
//! ```
//!
//! The client's requested command arrives in `SSH_ORIGINAL_COMMAND`.  On
//! success this process exits with the transport child's exact code; every
//! failure is a diagnostic on stderr (visible to the connecting client) and
//! exit code 1.  Nothing here can crash or hang the daemon itself.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitgate::policy::ExecPolicy;
use gitgate::session;

#[derive(Parser, Debug)]
#[command(name = "gitgate-session", about = "Per-connection Git session gateway")]
struct Cli {
    /// Authorization policy program (normally the `.authorize` link).
    policy: PathBuf,
    /// Username bound by the directive line.
    user: String,
    /// Fingerprint of the key that authenticated.
    fingerprint: String,
}

#[tokio::main]
async fn main() {
    // Stderr is the client's channel; stay quiet unless asked otherwise.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    let policy = ExecPolicy::new(&cli.policy);
    match session::run(&policy, &cli.user, &cli.fingerprint).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}
