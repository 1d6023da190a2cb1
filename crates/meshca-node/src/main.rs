//! meshca-node - certificate authority and node agent daemons
//!
//! # Examples
//!
//! ```bash
//! # Run the CA and issuance server
//! meshca-node ca --config /etc/meshca/ca.toml
//!
//! # Issue a bootstrap certificate for a node agent
//! meshca-node bootstrap --config /etc/meshca/ca.toml \
//!     --identity spiffe://cluster.local/ns/default/sa/web --out-dir ./bootstrap
//!
//! # Run a node agent
//! meshca-node agent --config /etc/meshca/agent.toml --output-dir /var/run/meshca/web
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod agent;
mod bootstrap;
mod ca;
mod output;

/// Mesh certificate authority and node agent.
#[derive(Parser)]
#[command(name = "meshca-node")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the certificate authority and issuance server
    Ca(ca::CaArgs),

    /// Run a node agent that keeps one workload credential fresh
    Agent(agent::AgentArgs),

    /// Issue a bootstrap certificate directly from the CA's stored root
    Bootstrap(bootstrap::BootstrapArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ca(args) => ca::execute(args).await,
        Commands::Agent(args) => agent::execute(args).await,
        Commands::Bootstrap(args) => bootstrap::execute(args).await,
    }
}

/// Returns a receiver that flips to true on ctrl-c.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        let _ = tx.send(true);
    });
    rx
}
