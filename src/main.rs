//! Administrative CLI: provision a server directory, start the daemon, and
//! manage credential records.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gitgate::config::{self, KeyAlgo, Options};
use gitgate::server::Server;
use gitgate::store::PublicKey;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gitgate",
    about = "SSH access-control front end for Git repositories",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a server directory (refuses to touch one that is already
    /// configured).
    Config {
        /// Server directory to create.
        dir: PathBuf,
        /// Port to listen on.
        #[arg(long, default_value_t = 2222)]
        port: u16,
        /// Address to listen on (repeatable).
        #[arg(long = "host", default_value = "0.0.0.0")]
        hosts: Vec<String>,
        /// Host-key types to generate (repeatable).
        #[arg(long = "key", value_enum, default_values_t = [KeyAlgo::Rsa])]
        keys: Vec<KeyAlgo>,
        /// Path of the authorization policy program.
        #[arg(long)]
        auth: Option<PathBuf>,
    },
    /// Start the daemon for a configured directory.
    Run {
        dir: PathBuf,
        /// Detach and run in the background.
        #[arg(long)]
        daemon: bool,
    },
    /// Authorize a public key for a user.
    AddUser {
        dir: PathBuf,
        user: String,
        /// OpenSSH public-key file (`<type> <base64> [comment]`).
        key_file: PathBuf,
    },
    /// Revoke a user's key by fingerprint.
    RmUser {
        dir: PathBuf,
        user: String,
        /// Hex fingerprint, with or without colon separators.
        fingerprint: String,
    },
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

fn require_unconfigured(dir: &Path) -> Result<()> {
    if config::options_path(dir).exists() {
        bail!("already configured: {}", dir.display());
    }
    Ok(())
}

fn require_configured(dir: &Path) -> Result<()> {
    if !config::options_path(dir).exists() {
        bail!(
            "missing configuration in {}, run `gitgate config` first",
            dir.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    match cli.command {
        Commands::Config {
            dir,
            port,
            hosts,
            keys,
            auth,
        } => {
            require_unconfigured(&dir)?;
            let options = Options {
                port,
                hosts,
                keys,
                auth_file: auth,
                // Leave a hand-tuned daemon config alone on re-runs.
                overwrite: false,
                ..Options::default()
            };
            Server::new(&dir, options)?.configure().await?;
        }

        Commands::Run { dir, daemon } => {
            require_configured(&dir)?;
            Server::open(&dir)?.run(daemon).await?;
        }

        Commands::AddUser {
            dir,
            user,
            key_file,
        } => {
            require_configured(&dir)?;
            let store = Server::open(&dir)?.store();
            let contents = tokio::fs::read_to_string(&key_file)
                .await
                .with_context(|| format!("failed to read key file: {}", key_file.display()))?;
            let key = PublicKey::parse(&contents)?;
            let fingerprint =
                tokio::task::spawn_blocking(move || store.add(&user, &key)).await??;
            println!("{fingerprint}");
        }

        Commands::RmUser {
            dir,
            user,
            fingerprint,
        } => {
            require_configured(&dir)?;
            let store = Server::open(&dir)?.store();
            tokio::task::spawn_blocking(move || store.remove(&user, &fingerprint)).await??;
        }
    }

    Ok(())
}
