//! TLS configuration for the issuance transport.
//!
//! Both ends authenticate with SPIFFE certificates: the server requires a
//! client certificate chaining to the trust bundle, and the client accepts
//! any server certificate that chains to the bundle and names a SPIFFE ID in
//! the expected trust domain. DNS names play no part.

use crate::certificate::{Certificate, IssuedCertificate, PrivateKey, TrustBundle};
use crate::identity::Identity;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Builder for the mTLS server configuration.
pub struct TlsServerConfig<'a> {
    cert: &'a IssuedCertificate,
    key: &'a PrivateKey,
    trust_bundle: &'a TrustBundle,
}

impl<'a> TlsServerConfig<'a> {
    pub fn new(cert: &'a IssuedCertificate, key: &'a PrivateKey, trust_bundle: &'a TrustBundle) -> Self {
        Self {
            cert,
            key,
            trust_bundle,
        }
    }

    /// Builds a configuration that requires client certificates issued under
    /// the trust bundle.
    pub fn build(self) -> Result<ServerConfig> {
        let _ = default_provider().install_default();

        let roots = self.trust_bundle.to_rustls_root_store()?;
        let client_verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| Error::Certificate(format!("failed to build client verifier: {e}")))?;

        ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(self.cert.cert_chain_der(), private_key_der(self.key)?)
            .map_err(|e| Error::Certificate(format!("failed to build server config: {e}")))
    }

    pub fn build_acceptor(self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.build()?)))
    }
}

/// Builder for the mTLS client configuration.
pub struct TlsClientConfig<'a> {
    cert: &'a IssuedCertificate,
    key: &'a PrivateKey,
    trust_bundle: &'a TrustBundle,
    trust_domain: String,
}

impl<'a> TlsClientConfig<'a> {
    /// `trust_domain` is the domain the server's SPIFFE ID must belong to.
    pub fn new(
        cert: &'a IssuedCertificate,
        key: &'a PrivateKey,
        trust_bundle: &'a TrustBundle,
        trust_domain: impl Into<String>,
    ) -> Self {
        Self {
            cert,
            key,
            trust_bundle,
            trust_domain: trust_domain.into(),
        }
    }

    pub fn build(self) -> Result<ClientConfig> {
        let _ = default_provider().install_default();

        let verifier = SpiffeServerCertVerifier {
            trust_bundle: Arc::new(self.trust_bundle.clone()),
            trust_domain: self.trust_domain,
        };
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(self.cert.cert_chain_der(), private_key_der(self.key)?)
            .map_err(|e| Error::Certificate(format!("failed to build client config: {e}")))
    }

    pub fn build_connector(self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.build()?)))
    }
}

/// Server name sent in the handshake. Verification ignores it; it only has
/// to be syntactically valid.
pub fn server_name_from_trust_domain(trust_domain: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(trust_domain.to_string())
        .map_err(|e| Error::Certificate(format!("invalid server name '{trust_domain}': {e}")))
}

/// Extracts the SPIFFE identity of a verified peer.
///
/// # Errors
///
/// [`Error::Unauthenticated`] when the peer sent no certificate or its leaf
/// carries no workload SPIFFE ID.
pub fn peer_identity(peer_certs: Option<&[CertificateDer<'_>]>) -> Result<Identity> {
    let leaf = peer_certs
        .and_then(|certs| certs.first())
        .ok_or_else(|| Error::Unauthenticated("no client certificate presented".to_string()))?;
    Certificate::from_der(leaf.to_vec())
        .spiffe_identity()
        .map_err(|e| Error::Unauthenticated(format!("client certificate has no identity: {e}")))
}

fn private_key_der(key: &PrivateKey) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::try_from(key.to_der()?)
        .map_err(|e| Error::Certificate(format!("invalid private key: {e}")))
}

/// Verifies server certificates against a trust bundle and requires a SPIFFE
/// ID in the expected trust domain instead of a DNS name.
#[derive(Debug)]
struct SpiffeServerCertVerifier {
    trust_bundle: Arc<TrustBundle>,
    trust_domain: String,
}

impl ServerCertVerifier for SpiffeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let chain: Vec<Certificate> = std::iter::once(end_entity)
            .chain(intermediates.iter())
            .map(|c| Certificate::from_der(c.to_vec()))
            .collect();

        let at = i64::try_from(now.as_secs())
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .ok_or(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ))?;

        let identity = self
            .trust_bundle
            .verify_for(&chain, at, webpki::KeyUsage::server_auth())
            .map_err(|e| {
                tracing::debug!(error = %e, "server certificate verification failed");
                rustls::Error::InvalidCertificate(rustls::CertificateError::BadSignature)
            })?;

        if !identity.is_in_trust_domain(&self.trust_domain) {
            tracing::debug!(
                identity = %identity,
                expected = %self.trust_domain,
                "server identity outside trust domain"
            );
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }

        tracing::debug!(identity = %identity, "verified server identity");
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
