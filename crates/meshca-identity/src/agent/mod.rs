//! Node agent: requests, persists and renews one workload credential.
//!
//! # State machine
//!
//! ```text
//! Uninitialized -> Requesting -> Holding -> Renewing -> Holding
//!                      |                       |
//!                      +------> Retrying <-----+
//!                                  |
//!                                  +--> Failed (no valid credential left)
//! ```
//!
//! A credential is persisted to the [`SecretStore`] before it is published
//! to subscribers, so a crash between the two never loses a credential that
//! a consumer has already seen. A failed renewal keeps serving the current
//! credential for as long as it is valid.

mod client;

pub use client::{LocalSigningClient, RemoteSigningClient, SigningClient};

use crate::certificate::{IssuedCertificate, PrivateKey};
use crate::config::AgentConfig;
use crate::csr::CsrOptions;
use crate::identity::Identity;
use crate::storage::SecretStore;
use crate::{wait_for_shutdown, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the agent is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    /// First request, no credential held.
    Requesting,
    /// A valid credential is held; waiting for its renewal deadline.
    Holding,
    /// First attempt of a renewal round.
    Renewing,
    /// A later attempt in a round; `attempt` starts at 2.
    Retrying { attempt: u32, renewing: bool },
    /// Every attempt failed and no valid credential remains.
    Failed,
}

/// A private key and the certificate issued for it.
#[derive(Clone)]
pub struct Credential {
    private_key: PrivateKey,
    certificate: IssuedCertificate,
    renewal_deadline: DateTime<Utc>,
}

impl Credential {
    /// Builds a credential whose renewal falls `grace_percentage` percent of
    /// the way through the certificate's lifetime.
    pub fn new(
        private_key: PrivateKey,
        certificate: IssuedCertificate,
        grace_percentage: u8,
    ) -> Self {
        let lifetime = certificate.ttl().num_seconds().max(0);
        let grace = chrono::Duration::seconds(lifetime * i64::from(grace_percentage) / 100);
        let renewal_deadline = certificate.not_before() + grace;
        Self {
            private_key,
            certificate,
            renewal_deadline,
        }
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    pub fn certificate(&self) -> &IssuedCertificate {
        &self.certificate
    }

    pub fn identity(&self) -> &Identity {
        self.certificate.identity()
    }

    pub fn renewal_deadline(&self) -> DateTime<Utc> {
        self.renewal_deadline
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate.not_after()
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.certificate.not_before() <= at && at < self.certificate.not_after()
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&CredentialRecord {
            private_key_pem: self.private_key.as_pem().to_string(),
            cert_chain_pem: self.certificate.chain_pem(),
            root_cert_pem: self.certificate.root_pem().to_string(),
        })
        .map_err(|e| Error::Internal(format!("failed to encode credential: {e}")))
    }

    fn from_json(bytes: &[u8], grace_percentage: u8) -> Result<Self> {
        let record: CredentialRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::Storage(format!("malformed credential record: {e}")))?;
        let private_key = PrivateKey::from_pem(&record.private_key_pem)?;
        let certificate =
            IssuedCertificate::from_pem(&record.cert_chain_pem, &record.root_cert_pem)?;
        if !private_key.matches(certificate.leaf())? {
            return Err(Error::Storage(
                "stored key does not match stored certificate".into(),
            ));
        }
        Ok(Self::new(private_key, certificate, grace_percentage))
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("identity", self.identity())
            .field("not_after", &self.not_after())
            .field("renewal_deadline", &self.renewal_deadline)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct CredentialRecord {
    private_key_pem: String,
    cert_chain_pem: String,
    root_cert_pem: String,
}

/// Persists credentials under `credentials/<spiffe-uri>`.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn SecretStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub fn key_for(identity: &Identity) -> String {
        format!("credentials/{}", identity.to_spiffe_uri())
    }

    /// Loads the stored credential for `identity`. An unreadable record is
    /// reported as absent so the agent requests a fresh one.
    pub async fn load(
        &self,
        identity: &Identity,
        grace_percentage: u8,
    ) -> Result<Option<Credential>> {
        let Some(bytes) = self.store.get(&Self::key_for(identity)).await? else {
            return Ok(None);
        };
        match Credential::from_json(&bytes, grace_percentage) {
            Ok(credential) if credential.identity() == identity => Ok(Some(credential)),
            Ok(credential) => {
                warn!(
                    expected = %identity,
                    found = %credential.identity(),
                    "stored credential names another identity; ignoring"
                );
                Ok(None)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "ignoring unreadable stored credential");
                Ok(None)
            }
        }
    }

    /// Durably writes `credential`.
    pub async fn save(&self, credential: &Credential) -> Result<()> {
        self.store
            .put(&Self::key_for(credential.identity()), credential.to_json()?)
            .await
    }
}

enum RoundOutcome {
    Issued,
    Shutdown,
    Failed { attempts: u32, error: Error },
}

/// Keeps one identity supplied with a valid credential.
pub struct NodeAgent {
    config: Arc<AgentConfig>,
    client: Arc<dyn SigningClient>,
    credentials: CredentialStore,
    state: watch::Sender<AgentState>,
    current: watch::Sender<Option<Arc<Credential>>>,
}

impl NodeAgent {
    pub fn new(
        config: Arc<AgentConfig>,
        client: Arc<dyn SigningClient>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Uninitialized);
        let (current, _) = watch::channel(None);
        Self {
            config,
            client,
            credentials: CredentialStore::new(store),
            state,
            current,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.config.identity
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Receives every published credential.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Credential>>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.borrow().clone()
    }

    /// Runs until `shutdown` becomes true.
    ///
    /// # Errors
    ///
    /// [`Error::RetriesExhausted`] when a round of attempts fails and no
    /// valid credential is left to serve.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.restore().await;

        loop {
            let valid = self.current().filter(|c| c.is_valid_at(Utc::now()));
            let renewing = match valid {
                Some(credential) => {
                    self.set_state(AgentState::Holding);
                    let wait = (credential.renewal_deadline() - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    debug!(
                        identity = %self.identity(),
                        renew_in_secs = wait.as_secs(),
                        "holding credential"
                    );
                    if !sleep_or_shutdown(wait, &mut shutdown).await {
                        break;
                    }
                    true
                }
                None => false,
            };

            match self.round(renewing, &mut shutdown).await {
                RoundOutcome::Issued => {}
                RoundOutcome::Shutdown => break,
                RoundOutcome::Failed { attempts, error } => {
                    let still_valid = self
                        .current()
                        .is_some_and(|c| c.is_valid_at(Utc::now()));
                    if !still_valid {
                        error!(
                            identity = %self.identity(),
                            attempts,
                            error = %error,
                            "certificate request failed with no valid credential"
                        );
                        self.set_state(AgentState::Failed);
                        return Err(Error::RetriesExhausted { attempts });
                    }
                    warn!(
                        identity = %self.identity(),
                        attempts,
                        error = %error,
                        "renewal failed; serving current credential"
                    );
                    self.set_state(AgentState::Holding);
                    if !sleep_or_shutdown(self.config.retry_interval(), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(identity = %self.identity(), "node agent stopped");
        Ok(())
    }

    async fn restore(&self) {
        let grace = self.config.csr_grace_period_percentage;
        match self.credentials.load(self.identity(), grace).await {
            Ok(Some(credential)) if credential.is_valid_at(Utc::now()) => {
                info!(
                    identity = %self.identity(),
                    not_after = %credential.not_after(),
                    "reusing stored credential"
                );
                self.current.send_replace(Some(Arc::new(credential)));
            }
            Ok(Some(_)) => debug!(identity = %self.identity(), "stored credential expired"),
            Ok(None) => {}
            Err(e) => warn!(identity = %self.identity(), error = %e, "failed to read stored credential"),
        }
    }

    async fn round(&self, renewing: bool, shutdown: &mut watch::Receiver<bool>) -> RoundOutcome {
        let max = self.config.csr_max_retries;
        let mut attempt = 1;

        self.set_state(if renewing {
            AgentState::Renewing
        } else {
            AgentState::Requesting
        });

        loop {
            let result = tokio::select! {
                result = self.attempt() => result,
                _ = wait_for_shutdown(shutdown) => return RoundOutcome::Shutdown,
            };

            let error = match result {
                Ok(credential) => {
                    info!(
                        identity = %self.identity(),
                        not_after = %credential.not_after(),
                        renew_at = %credential.renewal_deadline(),
                        "credential issued"
                    );
                    return RoundOutcome::Issued;
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max {
                return RoundOutcome::Failed {
                    attempts: attempt,
                    error,
                };
            }

            warn!(
                identity = %self.identity(),
                attempt,
                max,
                error = %error,
                "certificate request failed; retrying"
            );
            attempt += 1;
            self.set_state(AgentState::Retrying { attempt, renewing });
            if !sleep_or_shutdown(self.config.retry_interval(), shutdown).await {
                return RoundOutcome::Shutdown;
            }
        }
    }

    async fn attempt(&self) -> Result<Arc<Credential>> {
        let cert_sign = CsrOptions::new(self.identity().to_spiffe_uri())
            .with_organization(self.config.service_identity_org.clone())
            .with_algorithm(self.config.key_algorithm)
            .generate()?;

        let current = self.current().filter(|c| c.is_valid_at(Utc::now()));
        let timeout = self.config.request_timeout();
        let issued = tokio::time::timeout(
            timeout,
            self.client.sign(
                cert_sign.csr(),
                self.config.workload_cert_ttl(),
                current.as_deref(),
            ),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))??;

        if issued.identity() != self.identity() {
            return Err(Error::VerificationFailed(format!(
                "issued certificate names {}, expected {}",
                issued.identity(),
                self.identity()
            )));
        }
        let private_key = PrivateKey::from_pem(cert_sign.private_key())?;
        if !private_key.matches(issued.leaf())? {
            return Err(Error::VerificationFailed(
                "issued certificate does not carry the requested key".into(),
            ));
        }

        let credential = Arc::new(Credential::new(
            private_key,
            issued,
            self.config.csr_grace_period_percentage,
        ));
        self.credentials.save(&credential).await?;
        self.current.send_replace(Some(credential.clone()));
        Ok(credential)
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(identity = %self.identity(), from = ?previous, to = ?state, "agent state");
        }
    }
}

impl std::fmt::Debug for NodeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgent")
            .field("identity", self.identity())
            .field("state", &self.state())
            .finish()
    }
}

/// Sleeps for `duration`. Returns false if shutdown came first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = wait_for_shutdown(shutdown) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::KeyCertBundle;
    use crate::ca::{CaPolicy, CertificateAuthority};
    use crate::certificate::TrustBundle;
    use crate::csr::KeyAlgorithm;
    use crate::server::IssuanceServer;
    use crate::storage::MemorySecretStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn web() -> Identity {
        Identity::new("cluster.local", "default", "web")
    }

    fn local_client(id: &Identity) -> Arc<LocalSigningClient> {
        let bundle = KeyCertBundle::generate_self_signed(
            "cluster.local",
            "cluster.local",
            Duration::from_secs(30 * 86_400),
            KeyAlgorithm::EcdsaP256,
            Utc::now(),
        )
        .unwrap();
        let trust = TrustBundle::new(vec![bundle.root().clone()]);
        let ca = CertificateAuthority::with_bundle(
            CaPolicy {
                trust_domain: "cluster.local".into(),
                workload_cert_ttl: Duration::from_secs(3600),
                max_workload_cert_ttl: Duration::from_secs(86_400),
                ca_cert_ttl: Duration::from_secs(30 * 86_400),
                strict_ttl: false,
            },
            bundle,
            trust,
        );
        Arc::new(LocalSigningClient::new(
            Arc::new(IssuanceServer::new(Arc::new(ca))),
            id.clone(),
        ))
    }

    /// Delegates the first `succeed` calls, then fails with `error`.
    struct Flaky {
        inner: Option<Arc<LocalSigningClient>>,
        succeed: u32,
        calls: AtomicU32,
        error: fn() -> Error,
    }

    impl Flaky {
        fn new(inner: Option<Arc<LocalSigningClient>>, succeed: u32, error: fn() -> Error) -> Arc<Self> {
            Arc::new(Self {
                inner,
                succeed,
                calls: AtomicU32::new(0),
                error,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SigningClient for Flaky {
        async fn sign(
            &self,
            csr: &str,
            ttl: Duration,
            current: Option<&Credential>,
        ) -> Result<IssuedCertificate> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.inner {
                Some(inner) if n < self.succeed => inner.sign(csr, ttl, current).await,
                _ => Err((self.error)()),
            }
        }
    }

    fn unavailable() -> Error {
        Error::SigningUnavailable("rotating".into())
    }

    fn agent_config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig::new(web()))
    }

    async fn next_credential(
        rx: &mut watch::Receiver<Option<Arc<Credential>>>,
    ) -> Arc<Credential> {
        loop {
            rx.changed().await.unwrap();
            if let Some(credential) = rx.borrow_and_update().clone() {
                return credential;
            }
        }
    }

    #[tokio::test]
    async fn test_renewal_deadline() {
        let client = local_client(&web());
        let cert_sign = CsrOptions::new(web().to_spiffe_uri()).generate().unwrap();
        let issued = client
            .sign(cert_sign.csr(), Duration::from_secs(3600), None)
            .await
            .unwrap();
        let key = PrivateKey::from_pem(cert_sign.private_key()).unwrap();

        let credential = Credential::new(key.clone(), issued.clone(), 50);
        assert_eq!(
            credential.renewal_deadline(),
            issued.not_before() + chrono::Duration::minutes(30)
        );
        let late = Credential::new(key, issued.clone(), 80);
        assert_eq!(
            late.renewal_deadline(),
            issued.not_before() + chrono::Duration::minutes(48)
        );
        assert!(credential.is_valid_at(issued.not_before()));
        assert!(!credential.is_valid_at(issued.not_after()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_then_renews_at_grace() {
        let store = Arc::new(MemorySecretStore::new());
        let agent = Arc::new(NodeAgent::new(agent_config(), local_client(&web()), store));
        let mut creds = agent.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(shutdown_rx).await })
        };

        let first = next_credential(&mut creds).await;
        let issued_at = tokio::time::Instant::now();
        assert_eq!(first.identity(), &web());
        assert_eq!(first.certificate().ttl(), chrono::Duration::hours(1));

        let second = next_credential(&mut creds).await;
        let elapsed = issued_at.elapsed();
        assert!(
            elapsed >= Duration::from_secs(29 * 60) && elapsed <= Duration::from_secs(30 * 60 + 1),
            "renewed after {elapsed:?}"
        );
        assert_ne!(first.certificate().leaf(), second.certificate().leaf());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persists_before_publishing() {
        let store = Arc::new(MemorySecretStore::new());
        let agent = Arc::new(NodeAgent::new(
            agent_config(),
            local_client(&web()),
            store.clone(),
        ));
        let mut creds = agent.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(shutdown_rx).await })
        };

        let published = next_credential(&mut creds).await;
        let stored = CredentialStore::new(store)
            .load(&web(), 50)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.certificate().leaf(), published.certificate().leaf());
        assert_eq!(stored.private_key().as_pem(), published.private_key().as_pem());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    /// Never answers.
    struct Hanging {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SigningClient for Hanging {
        async fn sign(
            &self,
            _csr: &str,
            _ttl: Duration,
            _current: Option<&Credential>,
        ) -> Result<IssuedCertificate> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_count_toward_retries() {
        let client = Arc::new(Hanging {
            calls: AtomicU32::new(0),
        });
        let config = agent_config();
        let agent = NodeAgent::new(
            config.clone(),
            client.clone(),
            Arc::new(MemorySecretStore::new()),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let err = agent.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 5 }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 5);
        assert_eq!(agent.state(), AgentState::Failed);

        let expected = config.request_timeout() * 5 + config.retry_interval() * 4;
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_secs(1),
            "gave up after {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_credential_store_long_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::storage::FileSecretStore::open(dir.path()).await.unwrap());
        let id = Identity::new("cluster.local", "a".repeat(63), "b".repeat(150));
        let client = local_client(&id);
        let cert_sign = CsrOptions::new(id.to_spiffe_uri()).generate().unwrap();
        let issued = client
            .sign(cert_sign.csr(), Duration::from_secs(3600), None)
            .await
            .unwrap();
        let credential = Credential::new(
            PrivateKey::from_pem(cert_sign.private_key()).unwrap(),
            issued,
            50,
        );

        let credentials = CredentialStore::new(store);
        credentials.save(&credential).await.unwrap();
        let loaded = credentials.load(&id, 50).await.unwrap().unwrap();
        assert_eq!(loaded.certificate().leaf(), credential.certificate().leaf());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries_without_credential() {
        let client = Flaky::new(None, 0, unavailable);
        let agent = NodeAgent::new(agent_config(), client.clone(), Arc::new(MemorySecretStore::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let err = agent.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 5 }));
        assert_eq!(client.calls(), 5);
        assert_eq!(agent.state(), AgentState::Failed);
        // Four 5s pauses between five attempts.
        let elapsed = started.elapsed();
        assert!(
            elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21),
            "took {elapsed:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_ends_round() {
        let client = Flaky::new(None, 0, || Error::InvalidCsr("rejected".into()));
        let agent = NodeAgent::new(agent_config(), client.clone(), Arc::new(MemorySecretStore::new()));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = agent.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 1 }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_renewal_keeps_valid_credential() {
        let client = Flaky::new(Some(local_client(&web())), 1, unavailable);
        let agent = Arc::new(NodeAgent::new(
            agent_config(),
            client.clone(),
            Arc::new(MemorySecretStore::new()),
        ));
        let mut creds = agent.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(shutdown_rx).await })
        };

        let first = next_credential(&mut creds).await;
        // Renewal starts at 30m; five attempts 5s apart are over well before 31m.
        tokio::time::sleep(Duration::from_secs(31 * 60)).await;
        assert_eq!(client.calls(), 6);
        assert_eq!(agent.state(), AgentState::Holding);
        let current = agent.current().unwrap();
        assert_eq!(current.certificate().leaf(), first.certificate().leaf());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_stored_credential() {
        let store = Arc::new(MemorySecretStore::new());

        // First agent obtains and persists a credential.
        let first_agent = NodeAgent::new(agent_config(), local_client(&web()), store.clone());
        let mut creds = first_agent.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stored, result) = tokio::join!(
            async {
                let credential = next_credential(&mut creds).await;
                shutdown_tx.send(true).unwrap();
                credential
            },
            first_agent.run(shutdown_rx),
        );
        result.unwrap();

        // A restarted agent serves it without calling the CA.
        let client = Flaky::new(None, 0, unavailable);
        let agent = Arc::new(NodeAgent::new(agent_config(), client.clone(), store));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.calls(), 0);
        assert_eq!(agent.state(), AgentState::Holding);
        assert_eq!(
            agent.current().unwrap().certificate().leaf(),
            stored.certificate().leaf()
        );

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_sleep() {
        let client = Flaky::new(None, 0, unavailable);
        let agent = Arc::new(NodeAgent::new(
            agent_config(),
            client.clone(),
            Arc::new(MemorySecretStore::new()),
        ));
        let mut states = agent.subscribe_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.run(shutdown_rx).await })
        };

        states
            .wait_for(|s| matches!(s, AgentState::Retrying { attempt: 2, .. }))
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_credential_store_ignores_other_identity() {
        let store = Arc::new(MemorySecretStore::new());
        let credentials = CredentialStore::new(store.clone());
        let db = Identity::new("cluster.local", "default", "db");

        let client = local_client(&db);
        let cert_sign = CsrOptions::new(db.to_spiffe_uri()).generate().unwrap();
        let issued = client.sign(cert_sign.csr(), Duration::ZERO, None).await.unwrap();
        let credential = Credential::new(
            PrivateKey::from_pem(cert_sign.private_key()).unwrap(),
            issued,
            50,
        );
        let bytes = credential.to_json().unwrap();
        store
            .put(&CredentialStore::key_for(&web()), bytes)
            .await
            .unwrap();

        assert!(credentials.load(&web(), 50).await.unwrap().is_none());

        store
            .put(&CredentialStore::key_for(&web()), b"garbage".to_vec())
            .await
            .unwrap();
        assert!(credentials.load(&web(), 50).await.unwrap().is_none());
    }
}
