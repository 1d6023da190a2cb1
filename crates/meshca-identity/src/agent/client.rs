//! Signing clients used by the node agent.

use super::Credential;
use crate::certificate::{IssuedCertificate, PrivateKey, TrustBundle};
use crate::config::AgentConfig;
use crate::identity::Identity;
use crate::server::{self, IssuanceServer, Request, SignRequest};
use crate::tls::{server_name_from_trust_domain, TlsClientConfig};
use crate::{Error, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Obtains signed certificates from a CA.
#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Submits a PEM CSR.
    ///
    /// `current` is the caller's still-valid credential, if it has one;
    /// transports that authenticate with a client certificate use it in
    /// preference to any bootstrap material.
    async fn sign(
        &self,
        csr: &str,
        ttl: Duration,
        current: Option<&Credential>,
    ) -> Result<IssuedCertificate>;
}

/// Calls an in-process [`IssuanceServer`] as a fixed caller.
///
/// The CA binary uses this to obtain its own serving certificate, where there
/// is no transport to authenticate.
pub struct LocalSigningClient {
    server: Arc<IssuanceServer>,
    caller: Identity,
}

impl LocalSigningClient {
    pub fn new(server: Arc<IssuanceServer>, caller: Identity) -> Self {
        Self { server, caller }
    }
}

#[async_trait]
impl SigningClient for LocalSigningClient {
    async fn sign(
        &self,
        csr: &str,
        ttl: Duration,
        _current: Option<&Credential>,
    ) -> Result<IssuedCertificate> {
        self.server.sign(
            &self.caller,
            &SignRequest {
                csr: csr.to_string(),
                ttl,
            },
        )
    }
}

struct Bootstrap {
    cert: IssuedCertificate,
    key: PrivateKey,
}

/// Talks to a remote issuance server over mutual TLS.
///
/// Until the agent holds a credential of its own, the connection is
/// authenticated with the bootstrap certificate. After each successful
/// signature the trust bundle is refreshed from the server, which picks up a
/// staged root before it starts signing the server's certificate.
pub struct RemoteSigningClient {
    address: String,
    trust_domain: String,
    trust_bundle: ArcSwap<TrustBundle>,
    bootstrap: Option<Bootstrap>,
}

impl RemoteSigningClient {
    pub fn new(
        address: impl Into<String>,
        trust_domain: impl Into<String>,
        trust_bundle: TrustBundle,
    ) -> Self {
        Self {
            address: address.into(),
            trust_domain: trust_domain.into(),
            trust_bundle: ArcSwap::from_pointee(trust_bundle),
            bootstrap: None,
        }
    }

    /// Sets the certificate used before the agent has its own credential.
    pub fn with_bootstrap(mut self, cert: IssuedCertificate, key: PrivateKey) -> Self {
        self.bootstrap = Some(Bootstrap { cert, key });
        self
    }

    /// Builds a client from the agent configuration, reading the root and
    /// optional bootstrap material from disk.
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        let root_path = config
            .root_cert
            .as_deref()
            .ok_or_else(|| Error::Config("root_cert is required for a remote CA".into()))?;
        let trust_bundle = TrustBundle::from_pem(&read_file(root_path).await?)?;

        let client = Self::new(
            config.ca_address.clone(),
            config.identity.trust_domain(),
            trust_bundle,
        );
        match (&config.bootstrap_cert, &config.bootstrap_key) {
            (Some(cert_path), Some(key_path)) => {
                let chain_pem = read_file(cert_path).await?;
                let key = PrivateKey::from_pem(&read_file(key_path).await?)?;
                let root_pem = read_file(root_path).await?;
                let cert = IssuedCertificate::from_pem(&chain_pem, &root_pem)?;
                info!(identity = %cert.identity(), "loaded bootstrap certificate");
                Ok(client.with_bootstrap(cert, key))
            }
            (None, None) => Ok(client),
            _ => Err(Error::Config(
                "bootstrap_cert and bootstrap_key must be set together".into(),
            )),
        }
    }

    pub fn trust_bundle(&self) -> Arc<TrustBundle> {
        self.trust_bundle.load_full()
    }

    async fn connect(
        &self,
        cert: &IssuedCertificate,
        key: &PrivateKey,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let trust = self.trust_bundle.load_full();
        let connector =
            TlsClientConfig::new(cert, key, &trust, self.trust_domain.clone()).build_connector()?;
        let tcp = TcpStream::connect(&self.address)
            .await
            .map_err(|e| Error::Transport(format!("connect {}: {e}", self.address)))?;
        connector
            .connect(server_name_from_trust_domain(&self.trust_domain)?, tcp)
            .await
            .map_err(|e| Error::Transport(format!("TLS handshake with {}: {e}", self.address)))
    }
}

#[async_trait]
impl SigningClient for RemoteSigningClient {
    async fn sign(
        &self,
        csr: &str,
        ttl: Duration,
        current: Option<&Credential>,
    ) -> Result<IssuedCertificate> {
        let (cert, key) = match (current, &self.bootstrap) {
            (Some(credential), _) => (credential.certificate(), credential.private_key()),
            (None, Some(bootstrap)) => {
                debug!("authenticating with bootstrap certificate");
                (&bootstrap.cert, &bootstrap.key)
            }
            (None, None) => {
                return Err(Error::Unauthenticated(
                    "no credential or bootstrap certificate to authenticate with".into(),
                ))
            }
        };

        let mut stream = self.connect(cert, key).await?;
        let issued = server::call(
            &mut stream,
            &Request::Sign {
                csr: csr.to_string(),
                ttl_secs: ttl.as_secs(),
            },
        )
        .await?
        .into_issued()?;

        let refreshed = server::call(&mut stream, &Request::Bundle)
            .await
            .and_then(|r| r.into_trust_bundle());
        match refreshed {
            Ok(bundle) => self.trust_bundle.store(Arc::new(bundle)),
            Err(e) => debug!(error = %e, "trust bundle refresh failed; keeping current bundle"),
        }

        Ok(issued)
    }
}

async fn read_file(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))
}
