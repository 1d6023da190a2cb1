//! `meshca-node ca`: certificate authority and issuance server.

use anyhow::{bail, Context, Result};
use clap::Args;
use meshca_identity::{
    AgentConfig, CaConfig, CaPolicy, CertificateAuthority, FileSecretStore, IssuanceServer,
    KeyCertBundle, LocalSigningClient, NodeAgent, RootRotator, SecretStore,
    SelfSignedCaInitializer, TrustBundle,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct CaArgs {
    /// CA configuration file (TOML)
    #[arg(short, long, env = "MESHCA_CA_CONFIG")]
    config: PathBuf,

    /// Override the listen address from the config file
    #[arg(long, env = "MESHCA_CA_LISTEN")]
    listen: Option<String>,

    /// Override the secret store directory from the config file
    #[arg(long, env = "MESHCA_CA_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,
}

/// Loads the CA configuration with command-line overrides applied.
pub fn load_config(
    path: &std::path::Path,
    listen: Option<String>,
    storage_dir: Option<PathBuf>,
) -> Result<CaConfig> {
    let mut config = CaConfig::load(path)
        .with_context(|| format!("failed to load CA config {}", path.display()))?;
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if let Some(dir) = storage_dir {
        config.storage_dir = dir;
    }
    Ok(config)
}

/// Builds the CA from stored self-signed material or from the configured
/// external signing files. The initializer is returned for self-signed CAs
/// so the caller can drive root rotation.
pub async fn build_ca(
    config: &Arc<CaConfig>,
    store: Arc<dyn SecretStore>,
) -> Result<(Arc<CertificateAuthority>, Option<SelfSignedCaInitializer>)> {
    if !config.self_signed_ca {
        return Ok((load_external_ca(config).await?, None));
    }
    let initializer = SelfSignedCaInitializer::new(config.clone(), store);
    let ca = initializer
        .initialize()
        .await
        .context("failed to initialize self-signed CA")?;
    Ok((Arc::new(ca), Some(initializer)))
}

/// Loads the CA for one-off signing. Never generates or rotates a
/// self-signed root, so it is safe next to a running CA.
pub async fn load_ca(
    config: &Arc<CaConfig>,
    store: Arc<dyn SecretStore>,
) -> Result<Arc<CertificateAuthority>> {
    if !config.self_signed_ca {
        return load_external_ca(config).await;
    }
    let ca = SelfSignedCaInitializer::new(config.clone(), store)
        .load()
        .await
        .context("failed to load self-signed CA; start `meshca-node ca` first")?;
    Ok(Arc::new(ca))
}

async fn load_external_ca(config: &CaConfig) -> Result<Arc<CertificateAuthority>> {
    let (Some(cert), Some(key), Some(root)) = (
        config.signing_cert.as_deref(),
        config.signing_key.as_deref(),
        config.root_cert.as_deref(),
    ) else {
        bail!("signing_cert, signing_key and root_cert are required when self_signed_ca is false");
    };
    let bundle = KeyCertBundle::from_pem_files(cert, key, config.cert_chain.as_deref(), root)
        .await
        .context("failed to load CA signing material")?;
    info!(
        not_after = %bundle.not_after(),
        intermediates = bundle.intermediates().len(),
        "loaded external CA signing material"
    );
    let trust = TrustBundle::new(vec![bundle.root().clone()]);
    let ca = CertificateAuthority::with_bundle(CaPolicy::from_config(config), bundle, trust);
    Ok(Arc::new(ca))
}

pub async fn execute(args: CaArgs) -> Result<()> {
    let config = Arc::new(load_config(&args.config, args.listen, args.storage_dir)?);
    let store: Arc<dyn SecretStore> = Arc::new(
        FileSecretStore::open(&config.storage_dir)
            .await
            .context("failed to open secret store")?,
    );

    let (ca, initializer) = build_ca(&config, store.clone()).await?;
    let server = Arc::new(IssuanceServer::new(ca.clone()));
    let shutdown = crate::shutdown_signal();

    if let Some(initializer) = initializer {
        tokio::spawn(RootRotator::new(ca.clone(), initializer.clone()).run(shutdown.clone()));
        tokio::spawn(RootRotator::new(ca.clone(), initializer).follow(shutdown.clone()));
    }

    // The server's own serving certificate is issued and renewed in-process.
    let server_identity = config.server_identity()?;
    let mut agent_config = AgentConfig::new(server_identity.clone());
    agent_config.service_identity_org = config.self_signed_ca_org.clone();
    agent_config.workload_cert_ttl_secs = config.workload_cert_ttl_secs;
    agent_config.key_algorithm = config.key_algorithm;
    let agent = Arc::new(NodeAgent::new(
        Arc::new(agent_config),
        Arc::new(LocalSigningClient::new(server.clone(), server_identity)),
        store,
    ));
    let credentials = agent.subscribe();
    let agent_task = {
        let agent = agent.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { agent.run(shutdown).await })
    };

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        trust_domain = %config.trust_domain,
        "meshca CA started"
    );

    let served = server.serve(listener, credentials, shutdown).await;
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "serving credential agent failed"),
        Err(e) => error!(error = %e, "serving credential agent panicked"),
    }
    served.context("issuance server failed")
}
