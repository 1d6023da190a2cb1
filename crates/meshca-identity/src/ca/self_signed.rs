//! Self-signed root bootstrap and rotation.
//!
//! The root and its key are kept in the secret store under
//! `<storage-namespace>/ca-root`, with the trust bundle next to it under
//! `<storage-namespace>/trust-bundle`. Bootstrapping is idempotent: a stored
//! root that is still valid is reused, so restarts and additional replicas
//! converge on the same signing material.
//!
//! Rotation happens in two steps. A successor root is first staged under
//! `<storage-namespace>/ca-root-next` and added to the trust bundle while the
//! old root keeps signing. Once the activation delay has passed, every agent
//! has refreshed its trust bundle and the successor starts signing.
//!
//! # Example
//!
//! ```
//! use meshca_identity::{CaConfig, MemorySecretStore, SelfSignedCaInitializer};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemorySecretStore::new());
//! let init = SelfSignedCaInitializer::new(Arc::new(CaConfig::default()), store);
//! let first = init.bootstrap().await.unwrap();
//! let second = init.bootstrap().await.unwrap();
//! assert_eq!(first.root(), second.root());
//! # }
//! ```

use super::{CaPolicy, CertificateAuthority};
use crate::bundle::{to_chrono, KeyCertBundle};
use crate::certificate::TrustBundle;
use crate::config::CaConfig;
use crate::storage::SecretStore;
use crate::{wait_for_shutdown, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::StreamExt;

/// Outcome of one rotation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStep {
    /// Nothing to do yet.
    Unchanged,
    /// A successor root is trusted and starts signing at `activate_at`.
    Staged { activate_at: DateTime<Utc> },
    /// The staged root became the signing root.
    Activated,
}

/// A generated root waiting for its activation time.
#[derive(Serialize, Deserialize)]
struct PendingRecord {
    activate_at: DateTime<Utc>,
    bundle: String,
}

struct PendingRoot {
    bundle: KeyCertBundle,
    activate_at: DateTime<Utc>,
}

/// Creates or reloads the self-signed root.
#[derive(Clone)]
pub struct SelfSignedCaInitializer {
    config: Arc<CaConfig>,
    store: Arc<dyn SecretStore>,
}

impl SelfSignedCaInitializer {
    pub fn new(config: Arc<CaConfig>, store: Arc<dyn SecretStore>) -> Self {
        Self { config, store }
    }

    /// Returns the signing bundle, generating and persisting a new root if
    /// the store holds none or holds unusable material.
    ///
    /// A stored root that is due for rotation keeps signing; its successor
    /// is staged if none is yet, and activated later by [`RootRotator`].
    pub async fn bootstrap(&self) -> Result<KeyCertBundle> {
        let now = Utc::now();
        if let Some(bundle) = self.load_stored().await? {
            tracing::info!(
                not_after = %bundle.not_after(),
                "reusing stored self-signed root"
            );
            if self.needs_rotation(&bundle, now)? && self.load_pending().await?.is_none() {
                tracing::info!("stored root is due for rotation; staging a successor");
                let trust = self.load_trust_bundle(&bundle).await?;
                self.stage(&trust, now).await?;
            }
            return Ok(bundle);
        }

        let bundle = self.generate(now)?;
        let trust = TrustBundle::new(vec![bundle.root().clone()]);
        self.persist(&bundle, &trust).await?;
        tracing::info!(
            org = %self.config.self_signed_ca_org,
            not_after = %bundle.not_after(),
            "generated self-signed root"
        );
        Ok(bundle)
    }

    /// Bootstraps and returns a CA using the stored trust bundle.
    pub async fn initialize(&self) -> Result<CertificateAuthority> {
        let bundle = self.bootstrap().await?;
        self.with_stored_trust(bundle).await
    }

    /// Returns a CA over the stored root without ever generating one.
    ///
    /// # Errors
    ///
    /// [`Error::SigningUnavailable`] if no root is stored yet, or the error
    /// from loading it if the stored material is unusable.
    pub async fn load(&self) -> Result<CertificateAuthority> {
        let key = self.config.ca_root_key();
        let bytes = self.store.get(&key).await?.ok_or_else(|| {
            Error::SigningUnavailable(format!("no CA root stored under {key}"))
        })?;
        let bundle = KeyCertBundle::from_json(&bytes)?;
        self.with_stored_trust(bundle).await
    }

    async fn with_stored_trust(&self, bundle: KeyCertBundle) -> Result<CertificateAuthority> {
        let trust = self.load_trust_bundle(&bundle).await?;
        Ok(CertificateAuthority::with_bundle(
            CaPolicy::from_config(&self.config),
            bundle,
            trust,
        ))
    }

    /// Reads the stored trust bundle, falling back to one holding only
    /// `bundle`'s root.
    pub async fn load_trust_bundle(&self, bundle: &KeyCertBundle) -> Result<TrustBundle> {
        let key = self.config.trust_bundle_key();
        match self.store.get(&key).await? {
            Some(bytes) => match TrustBundle::from_json(&bytes) {
                Ok(trust) if trust.contains(bundle.root()) => Ok(trust),
                Ok(_) => {
                    tracing::warn!(key = %key, "stored trust bundle lacks the current root");
                    Ok(TrustBundle::new(vec![bundle.root().clone()]))
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "ignoring malformed trust bundle");
                    Ok(TrustBundle::new(vec![bundle.root().clone()]))
                }
            },
            None => Ok(TrustBundle::new(vec![bundle.root().clone()])),
        }
    }

    async fn load_stored(&self) -> Result<Option<KeyCertBundle>> {
        let key = self.config.ca_root_key();
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        match KeyCertBundle::from_json(&bytes) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "stored CA material unusable; regenerating");
                Ok(None)
            }
        }
    }

    async fn load_pending(&self) -> Result<Option<PendingRoot>> {
        let key = self.config.pending_root_key();
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let parsed = serde_json::from_slice::<PendingRecord>(&bytes)
            .map_err(|e| Error::Certificate(format!("malformed pending root: {e}")))
            .and_then(|record| {
                let bundle =
                    KeyCertBundle::from_json_at(record.bundle.as_bytes(), record.activate_at)?;
                Ok(PendingRoot {
                    bundle,
                    activate_at: record.activate_at,
                })
            });
        match parsed {
            Ok(pending) => Ok(Some(pending)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "ignoring unusable pending root");
                Ok(None)
            }
        }
    }

    /// Generates a successor root, persists `trust` extended with it, then
    /// the pending record. Returns the extended trust bundle and the
    /// activation time.
    async fn stage(
        &self,
        trust: &TrustBundle,
        now: DateTime<Utc>,
    ) -> Result<(TrustBundle, DateTime<Utc>)> {
        let next = self.generate(now)?;
        let activate_at = now + to_chrono(self.config.root_activation_delay())?;
        let trust = trust.with_root(next.root().clone());
        let bundle = String::from_utf8(next.to_json()?)
            .map_err(|e| Error::Internal(format!("CA bundle is not UTF-8: {e}")))?;
        let record = serde_json::to_vec(&PendingRecord {
            activate_at,
            bundle,
        })
        .map_err(|e| Error::Internal(format!("failed to encode pending root: {e}")))?;

        self.store
            .put(&self.config.trust_bundle_key(), trust.to_json()?)
            .await?;
        self.store.put(&self.config.pending_root_key(), record).await?;
        tracing::info!(
            activate_at = %activate_at,
            not_after = %next.not_after(),
            "staged successor root"
        );
        Ok((trust, activate_at))
    }

    fn needs_rotation(&self, bundle: &KeyCertBundle, now: DateTime<Utc>) -> Result<bool> {
        Ok(bundle.remaining(now) < to_chrono(self.config.root_rotation_threshold())?)
    }

    fn overlap_until(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(now + to_chrono(self.config.max_workload_cert_ttl())?)
    }

    fn generate(&self, now: DateTime<Utc>) -> Result<KeyCertBundle> {
        KeyCertBundle::generate_self_signed(
            &self.config.self_signed_ca_org,
            &self.config.trust_domain,
            self.config.ca_cert_ttl(),
            self.config.key_algorithm,
            now,
        )
    }

    /// Trust bundle first: a reader that sees the new root always finds it
    /// already trusted.
    async fn persist(&self, bundle: &KeyCertBundle, trust: &TrustBundle) -> Result<()> {
        self.store
            .put(&self.config.trust_bundle_key(), trust.to_json()?)
            .await?;
        self.store
            .put(&self.config.ca_root_key(), bundle.to_json()?)
            .await
    }
}

/// Replaces the self-signed root before it expires.
pub struct RootRotator {
    ca: Arc<CertificateAuthority>,
    initializer: SelfSignedCaInitializer,
}

impl RootRotator {
    pub fn new(ca: Arc<CertificateAuthority>, initializer: SelfSignedCaInitializer) -> Self {
        Self { ca, initializer }
    }

    /// Advances root rotation as of `now`.
    ///
    /// A root whose remaining validity is below the threshold gets a staged
    /// successor, which is published in the trust bundle while the current
    /// root keeps signing. Once the activation time has passed the successor
    /// becomes the signing root, and the old root stays trusted for the
    /// maximum workload TTL so its certificates can expire naturally.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<RotationStep> {
        let current = self
            .ca
            .bundle()
            .ok_or_else(|| Error::SigningUnavailable("no active root to rotate".to_string()))?;

        if let Some(pending) = self.initializer.load_pending().await? {
            if pending.bundle.root() != current.root() {
                if now >= pending.activate_at {
                    return self.activate(&current, pending.bundle, now).await;
                }
                let trust = self.ca.trust_bundle();
                if !trust.contains(pending.bundle.root()) {
                    self.ca
                        .publish_trust_bundle(trust.with_root(pending.bundle.root().clone()));
                }
                return Ok(RotationStep::Unchanged);
            }
        }

        if !self.initializer.needs_rotation(&current, now)? {
            return Ok(RotationStep::Unchanged);
        }
        let (trust, activate_at) = self.initializer.stage(&self.ca.trust_bundle(), now).await?;
        self.ca.publish_trust_bundle(trust);
        Ok(RotationStep::Staged { activate_at })
    }

    async fn activate(
        &self,
        current: &KeyCertBundle,
        next: KeyCertBundle,
        now: DateTime<Utc>,
    ) -> Result<RotationStep> {
        let trust = self.ca.trust_bundle().rotated(
            next.root().clone(),
            now,
            self.initializer.overlap_until(now)?,
        );
        self.initializer.persist(&next, &trust).await?;

        tracing::info!(
            old_not_after = %current.not_after(),
            new_not_after = %next.not_after(),
            "activated successor root"
        );
        self.ca.rotate(next, trust);
        Ok(RotationStep::Activated)
    }

    /// Checks the root every rotation interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.initializer.config.rotation_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once(Utc::now()).await {
                        tracing::error!(error = %e, "root rotation check failed");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    tracing::info!("root rotator shutting down");
                    return;
                }
            }
        }
    }

    /// Adopts trust bundles and roots written by another replica or process
    /// sharing the secret store.
    pub async fn follow(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.initializer.config;
        let (root_key, trust_key) = (config.ca_root_key(), config.trust_bundle_key());
        let mut changes = self
            .initializer
            .store
            .watch(&root_key)
            .merge(self.initializer.store.watch(&trust_key));
        loop {
            tokio::select! {
                event = changes.next() => {
                    let Some(event) = event else {
                        tracing::warn!("secret store watch ended");
                        return;
                    };
                    let adopted = if event.key == trust_key {
                        self.adopt_trust(&event.value)
                    } else {
                        self.adopt(&event.value).await
                    };
                    if let Err(e) = adopted {
                        tracing::warn!(
                            key = %event.key,
                            error = %e,
                            "failed to adopt stored CA material"
                        );
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => return,
            }
        }
    }

    fn adopt_trust(&self, bytes: &[u8]) -> Result<()> {
        let trust = TrustBundle::from_json(bytes)?;
        if *self.ca.trust_bundle() == trust {
            return Ok(());
        }
        match self.ca.bundle() {
            Some(current) if !trust.contains(current.root()) => {
                // The matching root write follows and brings its own bundle.
                tracing::debug!("stored trust bundle lacks the active root; waiting for the root");
                Ok(())
            }
            _ => {
                tracing::info!(anchors = trust.anchors().len(), "adopting stored trust bundle");
                self.ca.publish_trust_bundle(trust);
                Ok(())
            }
        }
    }

    async fn adopt(&self, bytes: &[u8]) -> Result<()> {
        let bundle = KeyCertBundle::from_json(bytes)?;
        if let Some(current) = self.ca.bundle() {
            if current.root() == bundle.root() {
                return Ok(());
            }
        }
        let trust = self.initializer.load_trust_bundle(&bundle).await?;
        tracing::info!(not_after = %bundle.not_after(), "adopting root rotated elsewhere");
        self.ca.rotate(bundle, trust);
        Ok(())
    }
}
