//! Workload certificate issuance and rotation for a mesh control plane.
//!
//! This crate holds the security-critical path of the mesh: a certificate
//! authority that signs short-lived SPIFFE workload certificates and the
//! node-side agent that requests, persists and rotates them before expiry.
//!
//! # Components
//!
//! - [`identity`] - SPIFFE ID types and parsing
//! - [`csr`] - key pair and CSR generation, server-side CSR validation
//! - [`certificate`] - X.509 certificates, issued certificates, trust bundles
//! - [`bundle`] - the CA's signing key and certificate chain
//! - [`ca`] - the certificate authority, self-signed bootstrap and root rotation
//! - [`storage`] - secret storage collaborator (memory and file backed)
//! - [`server`] - issuance server, wire protocol and mTLS transport
//! - [`agent`] - node agent renewal state machine and signing clients
//! - [`config`] - CA and agent configuration
//! - [`tls`] - rustls configuration built from issued credentials

pub mod agent;
pub mod bundle;
pub mod ca;
pub mod certificate;
pub mod config;
pub mod csr;
pub mod identity;
pub mod server;
pub mod storage;
pub mod tls;

pub use agent::{
    AgentState, Credential, CredentialStore, LocalSigningClient, NodeAgent, RemoteSigningClient,
    SigningClient,
};
pub use bundle::KeyCertBundle;
pub use ca::{
    CaPolicy, CertificateAuthority, RootRotator, RotationStep, SelfSignedCaInitializer,
    SigningRequest,
};
pub use certificate::{Certificate, IssuedCertificate, PrivateKey, TrustBundle};
pub use config::{AgentConfig, CaConfig, KeyAlgorithm};
pub use csr::{CertSign, CertificateRequest, CsrOptions};
pub use identity::Identity;
pub use server::{IssuanceServer, SignRequest};
pub use storage::{ChangeEvent, FileSecretStore, MemorySecretStore, SecretStore};

use std::time::Duration;

/// Errors that can occur in meshca-identity operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid SPIFFE URI format.
    #[error("invalid SPIFFE URI: {0}")]
    InvalidSpiffeUri(String),

    /// The CSR could not be parsed, failed its signature check, or carries
    /// no usable identity.
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// CSR generation error.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// Certificate parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// The signing library failed while building the certificate.
    #[error("CA signing failed: {0}")]
    CaSigning(String),

    /// A workload CSR asked for CA-capable key usage.
    #[error("CA key usage not authorized for {0}")]
    CaUsageNotAuthorized(String),

    /// Requested TTL is above the policy ceiling and the CA runs in strict mode.
    #[error("requested TTL {requested:?} exceeds policy maximum {max:?}")]
    TtlExceedsPolicy { requested: Duration, max: Duration },

    /// No signing bundle is active yet.
    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),

    /// The CA's own signing certificate has expired.
    #[error("signing certificate expired at {0}")]
    SignerExpired(chrono::DateTime<chrono::Utc>),

    /// Trust domain mismatch.
    #[error("trust domain mismatch: expected {expected}, got {actual}")]
    TrustDomainMismatch { expected: String, actual: String },

    /// The caller asked for an identity other than its own.
    #[error("caller {caller} may not request identity {requested}")]
    UnauthorizedIdentity { caller: String, requested: String },

    /// The caller presented no usable transport identity.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Identity or chain verification failed.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// Secret store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A signing RPC did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or framing failure talking to the issuance server.
    #[error("transport error: {0}")]
    Transport(String),

    /// The issuance server refused the request. `kind` is the wire error kind.
    #[error("issuance server rejected request ({kind}): {message}")]
    Rejected { kind: String, message: String },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The agent exhausted its retry budget with no usable credential.
    #[error("certificate request failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for transient infrastructure failures the agent should
    /// retry. Input errors and fatal server errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SigningUnavailable(_)
                | Error::Storage(_)
                | Error::Timeout(_)
                | Error::Transport(_)
                | Error::Io(_)
        )
    }
}

/// Result type for meshca-identity operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resolves once `shutdown` is set, or its sender is dropped.
pub(crate) async fn wait_for_shutdown(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
