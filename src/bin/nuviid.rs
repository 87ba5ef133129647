use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nuvii_sync::{config::SyncConfig, root};

#[derive(Parser)]
#[command(name = "nuviid", version, about = "Nuvii cloud-files sync provider")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provider until interrupted.
    Run {
        /// Settings file with server_path and client_path.
        #[arg(long, default_value = "nuvii.toml")]
        config: PathBuf,
    },
    /// Remove every provider-prefixed sync-root registration and restart
    /// the shell. For recovering from broken registrations.
    Cleanup {
        #[arg(long, default_value = "NuviiSync")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run { config } => run(&config).await,
        Command::Cleanup { provider } => {
            let removed = root::purge(&provider)?;
            info!(removed, "cleanup finished");
            Ok(())
        }
    }
}

async fn run(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = SyncConfig::load(config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;

    let session = root::SyncSession::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    session.shutdown().await;
    Ok(())
}
