//! `meshca-node bootstrap`: issues a first certificate for a node agent.
//!
//! A remote agent must authenticate before it can ask for its own
//! certificate. This command signs one directly with the CA's stored
//! material, on the CA host, for the operator to hand to the agent. It only
//! reads that material; the running CA owns generation and rotation.

use crate::ca::{load_ca, load_config};
use crate::output::write_credential;
use anyhow::{Context, Result};
use clap::Args;
use meshca_identity::{
    CsrOptions, FileSecretStore, Identity, PrivateKey, SecretStore, SigningRequest,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Args, Debug)]
pub struct BootstrapArgs {
    /// CA configuration file (TOML)
    #[arg(short, long, env = "MESHCA_CA_CONFIG")]
    config: PathBuf,

    /// Identity to issue for, as a SPIFFE URI
    #[arg(long)]
    identity: Identity,

    /// Certificate lifetime in seconds; 0 uses the CA default
    #[arg(long, default_value_t = 0)]
    ttl_secs: u64,

    /// Directory to write cert-chain.pem, key.pem and root-cert.pem into
    #[arg(long)]
    out_dir: PathBuf,
}

pub async fn execute(args: BootstrapArgs) -> Result<()> {
    let config = Arc::new(load_config(&args.config, None, None)?);
    let store: Arc<dyn SecretStore> = Arc::new(
        FileSecretStore::open(&config.storage_dir)
            .await
            .context("failed to open secret store")?,
    );
    let ca = load_ca(&config, store).await?;

    let cert_sign = CsrOptions::new(args.identity.to_spiffe_uri())
        .with_organization(config.self_signed_ca_org.clone())
        .with_algorithm(config.key_algorithm)
        .generate()?;
    let issued = ca
        .sign(&SigningRequest::Workload {
            csr: cert_sign.csr().to_string(),
            ttl: Duration::from_secs(args.ttl_secs),
        })
        .with_context(|| format!("failed to sign bootstrap certificate for {}", args.identity))?;
    let key = PrivateKey::from_pem(cert_sign.private_key())?;

    write_credential(&args.out_dir, &issued, &key).await?;
    info!(
        identity = %issued.identity(),
        not_after = %issued.not_after(),
        dir = %args.out_dir.display(),
        "issued bootstrap certificate"
    );
    Ok(())
}
