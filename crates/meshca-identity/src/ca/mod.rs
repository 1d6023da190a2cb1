//! Certificate authority.
//!
//! [`CertificateAuthority`] signs workload and CA-chain certificates from
//! CSRs. Signing material lives behind an atomic pointer so rotation never
//! blocks or tears an in-flight signature: each `sign` loads the bundle once
//! and uses it to the end.
//!
//! - [`SelfSignedCaInitializer`] bootstraps or reloads a self-signed root
//! - [`RootRotator`] replaces that root before it expires

mod self_signed;

pub use self_signed::{RootRotator, RotationStep, SelfSignedCaInitializer};

use crate::bundle::{random_serial, to_chrono, to_offset, truncate_to_secs, KeyCertBundle};
use crate::certificate::{Certificate, IssuedCertificate, TrustBundle};
use crate::config::CaConfig;
use crate::csr::CertificateRequest;
use crate::{Error, Result};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType,
};
use std::sync::Arc;
use std::time::Duration;

/// TTL policy and trust domain of a CA.
#[derive(Debug, Clone)]
pub struct CaPolicy {
    pub trust_domain: String,
    /// TTL granted to workload requests that ask for none.
    pub workload_cert_ttl: Duration,
    pub max_workload_cert_ttl: Duration,
    /// TTL of CA-chain certificates; also their ceiling.
    pub ca_cert_ttl: Duration,
    /// Reject TTLs above the ceiling instead of clamping.
    pub strict_ttl: bool,
}

impl CaPolicy {
    pub fn from_config(config: &CaConfig) -> Self {
        Self {
            trust_domain: config.trust_domain.clone(),
            workload_cert_ttl: config.workload_cert_ttl(),
            max_workload_cert_ttl: config.max_workload_cert_ttl(),
            ca_cert_ttl: config.ca_cert_ttl(),
            strict_ttl: config.strict_ttl,
        }
    }
}

/// What the caller wants signed.
#[derive(Debug, Clone)]
pub enum SigningRequest {
    /// An end-entity certificate for a workload. A zero TTL means the
    /// policy default.
    Workload { csr: String, ttl: Duration },
    /// A certificate that may itself sign workload certificates.
    CaChain { csr: String, ttl: Duration },
}

impl SigningRequest {
    fn parts(&self) -> (&str, Duration, bool) {
        match self {
            SigningRequest::Workload { csr, ttl } => (csr, *ttl, false),
            SigningRequest::CaChain { csr, ttl } => (csr, *ttl, true),
        }
    }
}

/// A certificate authority for one trust domain.
pub struct CertificateAuthority {
    policy: CaPolicy,
    bundle: ArcSwapOption<KeyCertBundle>,
    trust_bundle: ArcSwap<TrustBundle>,
}

impl CertificateAuthority {
    /// Creates a CA with no signing material. Every `sign` fails with
    /// [`Error::SigningUnavailable`] until [`CertificateAuthority::rotate`].
    pub fn new(policy: CaPolicy) -> Self {
        Self {
            policy,
            bundle: ArcSwapOption::empty(),
            trust_bundle: ArcSwap::from_pointee(TrustBundle::new(Vec::new())),
        }
    }

    /// Creates a CA signing with `bundle` and trusting `trust_bundle`.
    pub fn with_bundle(policy: CaPolicy, bundle: KeyCertBundle, trust_bundle: TrustBundle) -> Self {
        let ca = Self::new(policy);
        ca.rotate(bundle, trust_bundle);
        ca
    }

    pub fn policy(&self) -> &CaPolicy {
        &self.policy
    }

    pub fn trust_domain(&self) -> &str {
        &self.policy.trust_domain
    }

    /// Returns the active signing bundle, if any.
    pub fn bundle(&self) -> Option<Arc<KeyCertBundle>> {
        self.bundle.load_full()
    }

    /// Returns the current trust bundle.
    pub fn trust_bundle(&self) -> Arc<TrustBundle> {
        self.trust_bundle.load_full()
    }

    /// Installs new signing material. The trust bundle is published first so
    /// verifiers accept the new root before anything is issued under it.
    pub fn rotate(&self, bundle: KeyCertBundle, trust_bundle: TrustBundle) {
        let trust_bundle = if trust_bundle.contains(bundle.root()) {
            trust_bundle
        } else {
            tracing::warn!("trust bundle lacks the signing root; adding it");
            trust_bundle.with_root(bundle.root().clone())
        };
        self.trust_bundle.store(Arc::new(trust_bundle));
        self.bundle.store(Some(Arc::new(bundle)));
    }

    /// Replaces the trust bundle without changing the signer. The active
    /// root is kept trusted.
    pub fn publish_trust_bundle(&self, trust_bundle: TrustBundle) {
        let trust_bundle = match self.bundle() {
            Some(bundle) if !trust_bundle.contains(bundle.root()) => {
                tracing::warn!("published trust bundle lacks the signing root; adding it");
                trust_bundle.with_root(bundle.root().clone())
            }
            _ => trust_bundle,
        };
        self.trust_bundle.store(Arc::new(trust_bundle));
    }

    /// Signs `request` as of now.
    pub fn sign(&self, request: &SigningRequest) -> Result<IssuedCertificate> {
        self.sign_at(request, Utc::now())
    }

    /// Signs `request` with `now` as the issuance time.
    ///
    /// The issued TTL is the smallest of the requested TTL (or the default),
    /// the policy ceiling and the signing certificate's remaining validity.
    /// `NotBefore` is `now` truncated to whole seconds.
    pub fn sign_at(
        &self,
        request: &SigningRequest,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        let bundle = self.bundle.load_full().ok_or_else(|| {
            Error::SigningUnavailable("no signing certificate loaded".to_string())
        })?;

        let (csr_pem, requested, for_ca) = request.parts();
        let csr = CertificateRequest::parse(csr_pem)?;
        let identity = csr.identity();

        if !identity.is_in_trust_domain(&self.policy.trust_domain) {
            return Err(Error::TrustDomainMismatch {
                expected: self.policy.trust_domain.clone(),
                actual: identity.trust_domain().to_string(),
            });
        }
        if !for_ca && csr.requests_ca_usage() {
            tracing::warn!(identity = %identity, "workload CSR requested CA key usage");
            return Err(Error::CaUsageNotAuthorized(identity.to_spiffe_uri()));
        }

        let ttl = self.policy_ttl(requested, for_ca)?;

        let not_before = truncate_to_secs(now);
        let remaining = bundle.remaining(not_before);
        if remaining <= chrono::Duration::zero() {
            tracing::error!(
                not_after = %bundle.not_after(),
                "signing certificate has expired; refusing to issue"
            );
            return Err(Error::SignerExpired(bundle.not_after()));
        }
        let mut ttl = to_chrono(ttl)?;
        if ttl > remaining {
            tracing::warn!(
                identity = %identity,
                requested_secs = ttl.num_seconds(),
                remaining_secs = remaining.num_seconds(),
                "capping TTL to signing certificate lifetime"
            );
            ttl = remaining;
        }
        let not_after = not_before + ttl;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::CaSigning(format!("failed to create params: {e}")))?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.service_account());
        dn.push(DnType::OrganizationalUnitName, identity.namespace());
        params.distinguished_name = dn;
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(random_serial()?);

        if for_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        } else {
            params.is_ca = IsCa::ExplicitNoCa;
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages = vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ];
        }

        let san = rcgen::string::Ia5String::try_from(identity.to_spiffe_uri())
            .map_err(|e| Error::CaSigning(format!("invalid SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san)];

        // Only the CSR's public key is carried over; everything else comes
        // from the parameters built above.
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| Error::InvalidCsr(format!("failed to parse CSR: {e}")))?;
        csr_params.params = params;

        let signed = csr_params.signed_by(bundle.issuer()).map_err(|e| {
            tracing::error!(identity = %identity, error = %e, "certificate signing failed");
            Error::CaSigning(format!("certificate signing failed: {e}"))
        })?;

        let issued = IssuedCertificate::new(
            Certificate::from_der(signed.der().to_vec()),
            bundle.issued_chain(),
            bundle.root().clone(),
        )?;

        tracing::info!(
            identity = %identity,
            ca = for_ca,
            not_after = %issued.not_after(),
            "issued certificate"
        );
        Ok(issued)
    }

    fn policy_ttl(&self, requested: Duration, for_ca: bool) -> Result<Duration> {
        let (default, max) = if for_ca {
            (self.policy.ca_cert_ttl, self.policy.ca_cert_ttl)
        } else {
            (
                self.policy.workload_cert_ttl,
                self.policy.max_workload_cert_ttl,
            )
        };
        if requested.is_zero() {
            return Ok(default);
        }
        // Certificates carry whole seconds.
        let requested = Duration::from_secs(requested.as_secs().max(1));
        if requested > max {
            if self.policy.strict_ttl {
                return Err(Error::TtlExceedsPolicy { requested, max });
            }
            tracing::warn!(
                requested_secs = requested.as_secs(),
                max_secs = max.as_secs(),
                "clamping requested TTL to policy maximum"
            );
            return Ok(max);
        }
        Ok(requested)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("trust_domain", &self.policy.trust_domain)
            .field(
                "signer_not_after",
                &self.bundle.load_full().map(|b| b.not_after()),
            )
            .finish()
    }
}
