//! Issuance server.
//!
//! [`IssuanceServer`] authorizes signing requests against the caller's
//! authenticated identity and delegates to the [`CertificateAuthority`].
//!
//! # Protocol
//!
//! Requests and responses are newline-delimited JSON over a mutually
//! authenticated TLS connection. The caller identity is the SPIFFE ID of the
//! client certificate; nothing in the request body can change it.
//!
//! ```text
//! -> {"op":"sign","csr":"-----BEGIN CERTIFICATE REQUEST-----...","ttl_secs":3600}
//! <- {"type":"certificate","cert_chain":"-----BEGIN CERTIFICATE-----...","root_cert":"..."}
//! -> {"op":"bundle"}
//! <- {"type":"bundle","trust_domain":"cluster.local","bundle_pem":"...","anchors":[{"cert_pem":"...","trusted_until":"..."}]}
//! -> {"op":"ping"}
//! <- {"type":"pong"}
//! <- {"type":"error","kind":"unauthorized_identity","message":"..."}
//! ```

use crate::agent::Credential;
use crate::ca::{CertificateAuthority, SigningRequest};
use crate::certificate::{AnchorRecord, IssuedCertificate, TrustBundle};
use crate::csr::CertificateRequest;
use crate::identity::Identity;
use crate::tls::{peer_identity, TlsServerConfig};
use crate::{wait_for_shutdown, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Upper bound on one request or response line.
const MAX_FRAME_BYTES: u64 = 64 * 1024;

/// A workload signing request as seen by the server, after transport
/// authentication.
#[derive(Debug, Clone)]
pub struct SignRequest {
    /// PEM-encoded PKCS#10 CSR.
    pub csr: String,
    /// Requested lifetime. Zero asks for the CA default.
    pub ttl: Duration,
}

/// Wire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Sign {
        csr: String,
        #[serde(default)]
        ttl_secs: u64,
    },
    Bundle,
    Ping,
}

/// Wire response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Certificate {
        /// Leaf followed by intermediates.
        cert_chain: String,
        root_cert: String,
    },
    Bundle {
        trust_domain: String,
        /// Roots trusted now, for PEM consumers.
        bundle_pem: String,
        /// The same roots with their trust windows.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        anchors: Vec<AnchorRecord>,
    },
    Pong,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// Error classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    InvalidCsr,
    UnauthorizedIdentity,
    Unauthenticated,
    TtlExceedsPolicy,
    CaUsageNotAuthorized,
    SigningUnavailable,
    SignerExpired,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::InvalidCsr => "invalid_csr",
            ErrorKind::UnauthorizedIdentity => "unauthorized_identity",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::TtlExceedsPolicy => "ttl_exceeds_policy",
            ErrorKind::CaUsageNotAuthorized => "ca_usage_not_authorized",
            ErrorKind::SigningUnavailable => "signing_unavailable",
            ErrorKind::SignerExpired => "signer_expired",
            ErrorKind::Internal => "internal",
        }
    }

    /// Server-side failures that indicate the CA itself is broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorKind::SignerExpired | ErrorKind::Internal)
    }

    /// Rebuilds a library error on the client side of the wire.
    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::InvalidCsr => Error::InvalidCsr(message),
            ErrorKind::Unauthenticated => Error::Unauthenticated(message),
            ErrorKind::CaUsageNotAuthorized => Error::CaUsageNotAuthorized(message),
            ErrorKind::SigningUnavailable => Error::SigningUnavailable(message),
            other => Error::Rejected {
                kind: other.as_str().to_string(),
                message,
            },
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Error> for ErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidCsr(_) | Error::InvalidSpiffeUri(_) | Error::TrustDomainMismatch { .. } => {
                ErrorKind::InvalidCsr
            }
            Error::UnauthorizedIdentity { .. } => ErrorKind::UnauthorizedIdentity,
            Error::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Error::TtlExceedsPolicy { .. } => ErrorKind::TtlExceedsPolicy,
            Error::CaUsageNotAuthorized(_) => ErrorKind::CaUsageNotAuthorized,
            Error::SigningUnavailable(_) => ErrorKind::SigningUnavailable,
            Error::SignerExpired(_) => ErrorKind::SignerExpired,
            _ => ErrorKind::Internal,
        }
    }
}

impl Response {
    fn error(err: &Error) -> Self {
        Response::Error {
            kind: ErrorKind::from(err),
            message: err.to_string(),
        }
    }

    /// Interprets a response to [`Request::Sign`].
    pub fn into_issued(self) -> Result<IssuedCertificate> {
        match self {
            Response::Certificate {
                cert_chain,
                root_cert,
            } => IssuedCertificate::from_pem(&cert_chain, &root_cert),
            Response::Error { kind, message } => Err(kind.into_error(message)),
            other => Err(Error::Transport(format!(
                "unexpected response to sign: {other:?}"
            ))),
        }
    }

    /// Interprets a response to [`Request::Bundle`].
    pub fn into_trust_bundle(self) -> Result<TrustBundle> {
        match self {
            Response::Bundle {
                bundle_pem,
                anchors,
                ..
            } => {
                if anchors.is_empty() {
                    TrustBundle::from_pem(&bundle_pem)
                } else {
                    TrustBundle::from_records(anchors)
                }
            }
            Response::Error { kind, message } => Err(kind.into_error(message)),
            other => Err(Error::Transport(format!(
                "unexpected response to bundle: {other:?}"
            ))),
        }
    }
}

/// Authorizes signing requests and forwards them to the CA.
pub struct IssuanceServer {
    ca: Arc<CertificateAuthority>,
}

impl IssuanceServer {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self { ca }
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Signs a workload certificate for `caller`.
    ///
    /// # Errors
    ///
    /// [`Error::UnauthorizedIdentity`] when the CSR names any identity other
    /// than the caller's; otherwise whatever the CA reports.
    pub fn sign(&self, caller: &Identity, request: &SignRequest) -> Result<IssuedCertificate> {
        let csr = CertificateRequest::parse(&request.csr)?;
        if csr.identity() != caller {
            warn!(
                caller = %caller,
                requested = %csr.identity(),
                "rejected request for another identity"
            );
            return Err(Error::UnauthorizedIdentity {
                caller: caller.to_spiffe_uri(),
                requested: csr.identity().to_spiffe_uri(),
            });
        }

        let issued = self.ca.sign(&SigningRequest::Workload {
            csr: request.csr.clone(),
            ttl: request.ttl,
        })?;
        info!(
            identity = %issued.identity(),
            not_after = %issued.not_after(),
            "issued workload certificate"
        );
        Ok(issued)
    }

    /// Serves one logical request. `caller` is `None` when the transport
    /// could not establish an identity.
    pub fn handle(&self, caller: Option<&Identity>, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::Bundle => {
                let trust = self.ca.trust_bundle();
                let now = chrono::Utc::now();
                Response::Bundle {
                    trust_domain: self.ca.trust_domain().to_string(),
                    bundle_pem: trust.to_pem(),
                    anchors: trust.to_records_at(now),
                }
            }
            Request::Sign { csr, ttl_secs } => {
                let result = caller
                    .ok_or_else(|| Error::Unauthenticated("no verified client identity".into()))
                    .and_then(|caller| {
                        self.sign(
                            caller,
                            &SignRequest {
                                csr,
                                ttl: Duration::from_secs(ttl_secs),
                            },
                        )
                    });
                match result {
                    Ok(issued) => Response::Certificate {
                        cert_chain: issued.chain_pem(),
                        root_cert: issued.root_pem().to_string(),
                    },
                    Err(e) => {
                        let kind = ErrorKind::from(&e);
                        if kind.is_fatal() {
                            error!(kind = %kind, error = %e, "signing failed");
                        } else {
                            debug!(kind = %kind, error = %e, "signing request rejected");
                        }
                        Response::error(&e)
                    }
                }
            }
        }
    }

    /// Accepts mTLS connections until `shutdown` flips.
    ///
    /// The serving certificate is read from `credentials` on each accept, so
    /// a renewed credential or a rotated trust bundle takes effect for the
    /// next connection. Connections arriving before any credential exists
    /// are dropped.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        credentials: watch::Receiver<Option<Arc<Credential>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "issuance server listening");
        let mut acceptors = AcceptorCache::default();

        loop {
            let (stream, peer) = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("issuance server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let credential = credentials.borrow().clone();
            let Some(credential) = credential else {
                warn!(peer = %peer, "no serving credential yet; dropping connection");
                continue;
            };
            let acceptor = match acceptors.get(&credential, self.ca.trust_bundle()) {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    error!(error = %e, "failed to build TLS acceptor");
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls) => {
                        let caller = match peer_identity(tls.get_ref().1.peer_certificates()) {
                            Ok(id) => Some(id),
                            Err(e) => {
                                debug!(peer = %peer, error = %e, "peer has no identity");
                                None
                            }
                        };
                        if let Err(e) = server.handle_connection(tls, caller).await {
                            debug!(peer = %peer, error = %e, "connection closed with error");
                        }
                    }
                    Err(e) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                }
            });
        }
    }

    async fn handle_connection<S>(&self, stream: S, caller: Option<Identity>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let n = (&mut reader)
                .take(MAX_FRAME_BYTES)
                .read_line(&mut line)
                .await?;
            if n == 0 {
                break;
            }

            let oversized = !line.ends_with('\n') && n as u64 >= MAX_FRAME_BYTES;
            let response = if oversized {
                Response::Error {
                    kind: ErrorKind::BadRequest,
                    message: format!("request exceeds {MAX_FRAME_BYTES} bytes"),
                }
            } else {
                match serde_json::from_str::<Request>(line.trim()) {
                    Ok(request) => self.handle(caller.as_ref(), request),
                    Err(e) => Response::Error {
                        kind: ErrorKind::BadRequest,
                        message: format!("malformed request: {e}"),
                    },
                }
            };

            write_frame(&mut writer, &response).await?;
            if oversized {
                break;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for IssuanceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceServer")
            .field("trust_domain", &self.ca.trust_domain())
            .finish()
    }
}

#[derive(Default)]
struct AcceptorCache {
    current: Option<(Arc<Credential>, Arc<TrustBundle>, TlsAcceptor)>,
}

impl AcceptorCache {
    fn get(&mut self, credential: &Arc<Credential>, trust: Arc<TrustBundle>) -> Result<TlsAcceptor> {
        if let Some((cached_cred, cached_trust, acceptor)) = &self.current {
            if Arc::ptr_eq(cached_cred, credential) && Arc::ptr_eq(cached_trust, &trust) {
                return Ok(acceptor.clone());
            }
        }
        let acceptor =
            TlsServerConfig::new(credential.certificate(), credential.private_key(), &trust)
                .build_acceptor()?;
        debug!(not_after = %credential.not_after(), "rebuilt TLS acceptor");
        self.current = Some((credential.clone(), trust, acceptor.clone()));
        Ok(acceptor)
    }
}

async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value)
        .map_err(|e| Error::Internal(format!("failed to encode frame: {e}")))?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Sends one request on `stream` and reads one response.
pub async fn call<S>(stream: &mut S, request: &Request) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, request)
        .await
        .map_err(|e| Error::Transport(format!("failed to send request: {e}")))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = (&mut reader)
        .take(MAX_FRAME_BYTES)
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Transport(format!("failed to read response: {e}")))?;
    if n == 0 {
        return Err(Error::Transport("connection closed before response".into()));
    }
    serde_json::from_str(line.trim())
        .map_err(|e| Error::Transport(format!("malformed response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::KeyCertBundle;
    use crate::ca::CaPolicy;
    use crate::certificate::PrivateKey;
    use crate::csr::{CsrOptions, KeyAlgorithm};
    use crate::tls::{server_name_from_trust_domain, TlsClientConfig};
    use chrono::{DateTime, Utc};

    fn test_ca() -> Arc<CertificateAuthority> {
        let bundle = KeyCertBundle::generate_self_signed(
            "cluster.local",
            "cluster.local",
            Duration::from_secs(86_400),
            KeyAlgorithm::EcdsaP256,
            Utc::now(),
        )
        .unwrap();
        let trust = TrustBundle::new(vec![bundle.root().clone()]);
        Arc::new(CertificateAuthority::with_bundle(
            CaPolicy {
                trust_domain: "cluster.local".into(),
                workload_cert_ttl: Duration::from_secs(3600),
                max_workload_cert_ttl: Duration::from_secs(7200),
                ca_cert_ttl: Duration::from_secs(86_400),
                strict_ttl: false,
            },
            bundle,
            trust,
        ))
    }

    fn web() -> Identity {
        Identity::new("cluster.local", "default", "web")
    }

    fn credential_for(server: &IssuanceServer, id: &Identity) -> Credential {
        let cert_sign = CsrOptions::new(id.to_spiffe_uri()).generate().unwrap();
        let issued = server
            .sign(
                id,
                &SignRequest {
                    csr: cert_sign.csr().to_string(),
                    ttl: Duration::ZERO,
                },
            )
            .unwrap();
        Credential::new(
            PrivateKey::from_pem(cert_sign.private_key()).unwrap(),
            issued,
            50,
        )
    }

    #[test]
    fn test_sign_own_identity() {
        let server = IssuanceServer::new(test_ca());
        let cert_sign = CsrOptions::new(web().to_spiffe_uri()).generate().unwrap();
        let issued = server
            .sign(
                &web(),
                &SignRequest {
                    csr: cert_sign.csr().to_string(),
                    ttl: Duration::from_secs(600),
                },
            )
            .unwrap();
        assert_eq!(issued.identity(), &web());
        assert_eq!(issued.ttl(), chrono::Duration::seconds(600));
    }

    #[test]
    fn test_sign_other_identity_rejected() {
        let server = IssuanceServer::new(test_ca());
        let other = Identity::new("cluster.local", "kube-system", "admin");
        let cert_sign = CsrOptions::new(other.to_spiffe_uri()).generate().unwrap();
        let err = server
            .sign(
                &web(),
                &SignRequest {
                    csr: cert_sign.csr().to_string(),
                    ttl: Duration::ZERO,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedIdentity { .. }));
    }

    #[test]
    fn test_handle_sign_without_caller() {
        let server = IssuanceServer::new(test_ca());
        let cert_sign = CsrOptions::new(web().to_spiffe_uri()).generate().unwrap();
        let response = server.handle(
            None,
            Request::Sign {
                csr: cert_sign.csr().to_string(),
                ttl_secs: 0,
            },
        );
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::Unauthenticated,
                ..
            }
        ));
    }

    #[test]
    fn test_handle_error_kinds() {
        let server = IssuanceServer::new(test_ca());

        let garbage = server.handle(
            Some(&web()),
            Request::Sign {
                csr: "not a csr".into(),
                ttl_secs: 0,
            },
        );
        assert!(matches!(
            garbage,
            Response::Error {
                kind: ErrorKind::InvalidCsr,
                ..
            }
        ));

        let ca_csr = CsrOptions::new(web().to_spiffe_uri())
            .with_ca_usage()
            .generate()
            .unwrap();
        let ca_usage = server.handle(
            Some(&web()),
            Request::Sign {
                csr: ca_csr.csr().to_string(),
                ttl_secs: 0,
            },
        );
        assert!(matches!(
            ca_usage,
            Response::Error {
                kind: ErrorKind::CaUsageNotAuthorized,
                ..
            }
        ));
    }

    #[test]
    fn test_handle_unavailable_ca() {
        let ca = Arc::new(CertificateAuthority::new(test_ca().policy().clone()));
        let server = IssuanceServer::new(ca);
        let cert_sign = CsrOptions::new(web().to_spiffe_uri()).generate().unwrap();
        let response = server.handle(
            Some(&web()),
            Request::Sign {
                csr: cert_sign.csr().to_string(),
                ttl_secs: 0,
            },
        );
        let Response::Error { kind, message } = response else {
            panic!("expected error response");
        };
        assert_eq!(kind, ErrorKind::SigningUnavailable);
        assert!(kind.into_error(message).is_retryable());
    }

    #[test]
    fn test_handle_bundle_and_ping() {
        let ca = test_ca();
        let server = IssuanceServer::new(ca.clone());
        assert_eq!(server.handle(None, Request::Ping), Response::Pong);

        let bundle = server
            .handle(None, Request::Bundle)
            .into_trust_bundle()
            .unwrap();
        assert!(bundle.contains(ca.bundle().unwrap().root()));
    }

    #[test]
    fn test_bundle_response_carries_trust_windows() {
        let ca = test_ca();
        let old_root = ca.bundle().unwrap().root().clone();
        let next = KeyCertBundle::generate_self_signed(
            "cluster.local",
            "cluster.local",
            Duration::from_secs(86_400),
            KeyAlgorithm::EcdsaP256,
            Utc::now(),
        )
        .unwrap();
        let now = Utc::now();
        let until = DateTime::from_timestamp(now.timestamp() + 3600, 0).unwrap();
        let trust = ca.trust_bundle().rotated(next.root().clone(), now, until);
        ca.rotate(next, trust);

        let server = IssuanceServer::new(ca);
        let response = server.handle(None, Request::Bundle);
        let json = serde_json::to_string(&response).unwrap();
        let parsed: Response = serde_json::from_str(&json).unwrap();
        let bundle = parsed.into_trust_bundle().unwrap();

        let old = bundle
            .anchors()
            .iter()
            .find(|a| *a.certificate() == old_root)
            .unwrap();
        assert_eq!(old.trusted_until(), Some(until));
        assert!(bundle.roots_at(until).iter().all(|r| **r != old_root));
    }

    #[test]
    fn test_wire_format() {
        let request: Request =
            serde_json::from_str(r#"{"op":"sign","csr":"x"}"#).unwrap();
        assert_eq!(
            request,
            Request::Sign {
                csr: "x".into(),
                ttl_secs: 0
            }
        );

        let json = serde_json::to_string(&Response::Error {
            kind: ErrorKind::TtlExceedsPolicy,
            message: "too long".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"error","kind":"ttl_exceeds_policy","message":"too long"}"#
        );
    }

    #[test]
    fn test_remote_error_mapping() {
        assert!(matches!(
            ErrorKind::InvalidCsr.into_error("x".into()),
            Error::InvalidCsr(_)
        ));
        let err = ErrorKind::UnauthorizedIdentity.into_error("x".into());
        assert!(matches!(err, Error::Rejected { ref kind, .. } if kind == "unauthorized_identity"));
        assert!(!err.is_retryable());
        assert!(ErrorKind::SignerExpired.is_fatal());
        assert!(!ErrorKind::InvalidCsr.is_fatal());
    }

    #[tokio::test]
    async fn test_handle_connection_rejects_malformed_line() {
        let server = IssuanceServer::new(test_ca());
        let (mut client, conn) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { server.handle_connection(conn, None).await });

        client.write_all(b"{nonsense\n").await.unwrap();
        let mut reader = BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let response: Response = serde_json::from_str(line.trim()).unwrap();
        assert!(matches!(
            response,
            Response::Error {
                kind: ErrorKind::BadRequest,
                ..
            }
        ));

        drop(reader);
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_over_mtls() {
        let ca = test_ca();
        let server = Arc::new(IssuanceServer::new(ca.clone()));
        let server_id = Identity::new("cluster.local", "meshca-system", "meshca");
        let server_cred = Arc::new(credential_for(&server, &server_id));
        let client_cred = credential_for(&server, &web());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_cred_tx, cred_rx) = watch::channel(Some(server_cred));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve = tokio::spawn(server.clone().serve(listener, cred_rx, shutdown_rx));

        let trust = ca.trust_bundle();
        let connector = TlsClientConfig::new(
            client_cred.certificate(),
            client_cred.private_key(),
            &trust,
            "cluster.local",
        )
        .build_connector()
        .unwrap();
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut tls = connector
            .connect(server_name_from_trust_domain("cluster.local").unwrap(), tcp)
            .await
            .unwrap();

        let cert_sign = CsrOptions::new(web().to_spiffe_uri()).generate().unwrap();
        let issued = call(
            &mut tls,
            &Request::Sign {
                csr: cert_sign.csr().to_string(),
                ttl_secs: 300,
            },
        )
        .await
        .unwrap()
        .into_issued()
        .unwrap();
        assert_eq!(issued.identity(), &web());
        assert_eq!(issued.ttl(), chrono::Duration::seconds(300));

        // The authenticated identity wins over whatever the CSR names.
        let other = Identity::new("cluster.local", "default", "db");
        let other_csr = CsrOptions::new(other.to_spiffe_uri()).generate().unwrap();
        let err = call(
            &mut tls,
            &Request::Sign {
                csr: other_csr.csr().to_string(),
                ttl_secs: 0,
            },
        )
        .await
        .unwrap()
        .into_issued()
        .unwrap_err();
        assert!(matches!(err, Error::Rejected { ref kind, .. } if kind == "unauthorized_identity"));

        shutdown_tx.send(true).unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_ignores_false_and_stops_on_true() {
        let server = Arc::new(IssuanceServer::new(test_ca()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_cred_tx, cred_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut serve = tokio::spawn(server.serve(listener, cred_rx, shutdown_rx));

        shutdown_tx.send(false).unwrap();
        let still_running = tokio::time::timeout(Duration::from_millis(100), &mut serve).await;
        assert!(still_running.is_err());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), serve)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
