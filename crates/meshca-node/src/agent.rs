//! `meshca-node agent`: keeps one workload credential fresh.

use crate::output::write_credential;
use anyhow::{Context, Result};
use clap::Args;
use meshca_identity::{AgentConfig, Credential, FileSecretStore, NodeAgent, RemoteSigningClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct AgentArgs {
    /// Agent configuration file (TOML)
    #[arg(short, long, env = "MESHCA_AGENT_CONFIG")]
    config: PathBuf,

    /// Override the CA address from the config file
    #[arg(long, env = "MESHCA_CA_ADDRESS")]
    ca_address: Option<String>,

    /// Write cert-chain.pem, key.pem and root-cert.pem here on every renewal
    #[arg(long, env = "MESHCA_AGENT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

pub async fn execute(args: AgentArgs) -> Result<()> {
    let mut config = AgentConfig::load(&args.config)
        .with_context(|| format!("failed to load agent config {}", args.config.display()))?;
    if let Some(address) = args.ca_address {
        config.ca_address = address;
    }
    let config = Arc::new(config);

    let store = Arc::new(
        FileSecretStore::open(&config.storage_dir)
            .await
            .context("failed to open secret store")?,
    );
    let client = RemoteSigningClient::from_config(&config)
        .await
        .context("failed to configure signing client")?;

    let agent = NodeAgent::new(config.clone(), Arc::new(client), store);
    info!(
        identity = %config.identity,
        ca = %config.ca_address,
        "meshca agent started"
    );

    if let Some(dir) = args.output_dir {
        tokio::spawn(export_credentials(agent.subscribe(), dir));
    }

    agent
        .run(crate::shutdown_signal())
        .await
        .context("node agent stopped")
}

async fn export_credentials(mut rx: watch::Receiver<Option<Arc<Credential>>>, dir: PathBuf) {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(credential) = current {
            match write_credential(&dir, credential.certificate(), credential.private_key()).await
            {
                Ok(()) => info!(
                    dir = %dir.display(),
                    not_after = %credential.not_after(),
                    "wrote credential files"
                ),
                Err(e) => warn!(dir = %dir.display(), error = %e, "failed to write credential files"),
            }
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
