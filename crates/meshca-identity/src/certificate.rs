//! X.509 certificate handling for workload identities.
//!
//! This module provides types for certificates carrying SPIFFE identities in
//! their URI SANs, the certificates a CA hands back to callers, and the trust
//! bundle of root certificates used to verify them.

use crate::identity::Identity;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use rustls::pki_types::{SignatureVerificationAlgorithm, UnixTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};

/// Signature algorithms accepted when verifying chains.
pub(crate) static SUPPORTED_SIG_ALGS: &[&dyn SignatureVerificationAlgorithm] = &[
    webpki::ring::ECDSA_P256_SHA256,
    webpki::ring::ECDSA_P256_SHA384,
    webpki::ring::ECDSA_P384_SHA256,
    webpki::ring::ECDSA_P384_SHA384,
    webpki::ring::ED25519,
    webpki::ring::RSA_PKCS1_2048_8192_SHA256,
    webpki::ring::RSA_PKCS1_2048_8192_SHA384,
    webpki::ring::RSA_PKCS1_2048_8192_SHA512,
    webpki::ring::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
    webpki::ring::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
    webpki::ring::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
];

/// An X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// DER-encoded certificate data.
    der: Vec<u8>,
    /// PEM representation (cached).
    pem: String,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    ///
    /// The DER is not parsed here; accessors report malformed input.
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));
        Self { der, pem }
    }

    /// Creates a certificate from a single PEM block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let block = pem::parse(pem_str)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        if block.tag() != "CERTIFICATE" {
            return Err(Error::Certificate(format!(
                "unexpected PEM label: {}",
                block.tag()
            )));
        }
        let cert = Self::from_der(block.into_contents());
        cert.parse()?;
        Ok(cert)
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    fn parse(&self) -> Result<X509Certificate<'_>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        Ok(cert)
    }

    /// Extracts the workload identity from the certificate's URI SAN.
    pub fn spiffe_identity(&self) -> Result<Identity> {
        let uri = self
            .spiffe_uris()?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Certificate("no SPIFFE URI found in certificate SAN".into()))?;
        Identity::from_spiffe_uri(&uri)
    }

    /// Returns every `spiffe://` URI SAN in the certificate.
    pub fn spiffe_uris(&self) -> Result<Vec<String>> {
        let cert = self.parse()?;
        let mut uris = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    if let GeneralName::URI(uri) = name {
                        if uri.starts_with("spiffe://") {
                            uris.push(uri.to_string());
                        }
                    }
                }
            }
        }
        Ok(uris)
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let cert = self.parse()?;
        DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Certificate("invalid not_after timestamp".to_string()))
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        let cert = self.parse()?;
        DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
            .ok_or_else(|| Error::Certificate("invalid not_before timestamp".to_string()))
    }

    /// Returns the certificate's subject as a string.
    pub fn subject(&self) -> Result<String> {
        Ok(self.parse()?.subject().to_string())
    }

    /// Checks if this certificate is a CA certificate.
    pub fn is_ca(&self) -> Result<bool> {
        Ok(self.parse()?.is_ca())
    }

    /// Returns the raw subject public key bytes.
    pub fn public_key(&self) -> Result<Vec<u8>> {
        Ok(self.parse()?.public_key().subject_public_key.data.to_vec())
    }

    /// Checks that `issuer`'s key produced this certificate's signature and
    /// that the issuer names match.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let cert = self.parse()?;
        let issuer_cert = issuer.parse()?;
        if cert.issuer() != issuer_cert.subject() {
            return Err(Error::VerificationFailed(format!(
                "issuer name {} does not match {}",
                cert.issuer(),
                issuer_cert.subject()
            )));
        }
        cert.verify_signature(Some(issuer_cert.public_key()))
            .map_err(|e| Error::VerificationFailed(format!("signature check failed: {e}")))
    }

    /// Returns true if the certificate is valid at `at`.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> Result<bool> {
        Ok(self.not_before()? <= at && at < self.not_after()?)
    }
}

/// A private key.
#[derive(Clone)]
pub struct PrivateKey {
    /// PEM-encoded private key.
    pem: String,
}

impl PrivateKey {
    /// Creates a private key from PEM-encoded PKCS#8 data.
    pub fn from_pem(pem: &str) -> Result<Self> {
        KeyPair::from_pem(pem)
            .map_err(|e| Error::Certificate(format!("invalid private key: {e}")))?;
        Ok(Self {
            pem: pem.to_string(),
        })
    }

    /// Returns the PEM-encoded private key.
    pub fn as_pem(&self) -> &str {
        &self.pem
    }

    /// Converts to DER-encoded bytes.
    pub fn to_der(&self) -> Result<Vec<u8>> {
        let parsed = pem::parse(&self.pem)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        Ok(parsed.into_contents())
    }

    /// Loads the key as an rcgen signing key.
    pub fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.pem)
            .map_err(|e| Error::Certificate(format!("invalid private key: {e}")))
    }

    /// Checks that this key is the private half of `cert`'s public key.
    pub fn matches(&self, cert: &Certificate) -> Result<bool> {
        Ok(self.key_pair()?.public_key_raw() == cert.public_key()?.as_slice())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("pem", &"[REDACTED]")
            .finish()
    }
}

/// A certificate issued by the CA, with the chain needed to verify it.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    leaf: Certificate,
    /// Intermediates between the leaf and the root, issuer order.
    chain: Vec<Certificate>,
    root: Certificate,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    identity: Identity,
}

impl IssuedCertificate {
    /// Builds an issued certificate, reading validity and identity from the leaf.
    pub fn new(leaf: Certificate, chain: Vec<Certificate>, root: Certificate) -> Result<Self> {
        let not_before = leaf.not_before()?;
        let not_after = leaf.not_after()?;
        let identity = leaf.spiffe_identity()?;
        Ok(Self {
            leaf,
            chain,
            root,
            not_before,
            not_after,
            identity,
        })
    }

    /// Parses a PEM chain (leaf first, then intermediates) and a root PEM.
    pub fn from_pem(chain_pem: &str, root_pem: &str) -> Result<Self> {
        let mut certs = parse_cert_chain_pem(chain_pem)?.into_iter();
        let leaf = certs
            .next()
            .ok_or_else(|| Error::Certificate("empty certificate chain".to_string()))?;
        let root = Certificate::from_pem(root_pem)?;
        Self::new(leaf, certs.collect(), root)
    }

    /// Returns the leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.leaf
    }

    /// Returns the intermediates (excluding the root).
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// Returns the root certificate.
    pub fn root(&self) -> &Certificate {
        &self.root
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns the lifetime the CA granted.
    pub fn ttl(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    /// Returns the SPIFFE identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns the leaf followed by the intermediates as PEM.
    pub fn chain_pem(&self) -> String {
        std::iter::once(&self.leaf)
            .chain(self.chain.iter())
            .map(|c| c.to_pem())
            .collect()
    }

    /// Returns the root as PEM.
    pub fn root_pem(&self) -> &str {
        self.root.to_pem()
    }

    /// Returns the leaf and intermediates as DER, as presented in a TLS handshake.
    pub fn cert_chain_der(&self) -> Vec<rustls::pki_types::CertificateDer<'static>> {
        std::iter::once(&self.leaf)
            .chain(self.chain.iter())
            .map(|c| rustls::pki_types::CertificateDer::from(c.der().to_vec()))
            .collect()
    }
}

/// A trusted root with an optional end of trust.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchor {
    cert: Certificate,
    trusted_until: Option<DateTime<Utc>>,
}

impl TrustAnchor {
    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn trusted_until(&self) -> Option<DateTime<Utc>> {
        self.trusted_until
    }

    fn is_trusted_at(&self, at: DateTime<Utc>) -> bool {
        self.trusted_until.map_or(true, |until| at < until)
    }
}

/// A trust bundle containing root CA certificates.
///
/// After a root rotation the outgoing root stays in the bundle with a
/// `trusted_until` bound, so certificates it signed before the rotation keep
/// verifying until they expire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    anchors: Vec<TrustAnchor>,
}

/// Serialized form of one [`TrustAnchor`], shared by the secret store
/// record and the issuance protocol's bundle response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub cert_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_until: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct TrustBundleRecord {
    anchors: Vec<AnchorRecord>,
}

impl TrustBundle {
    /// Creates a new trust bundle from root certificates trusted indefinitely.
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self {
            anchors: roots
                .into_iter()
                .map(|cert| TrustAnchor {
                    cert,
                    trusted_until: None,
                })
                .collect(),
        }
    }

    /// Creates a trust bundle from PEM-encoded certificates.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let roots = parse_cert_chain_pem(pem)?;
        if roots.is_empty() {
            return Err(Error::Certificate("trust bundle has no roots".to_string()));
        }
        Ok(Self::new(roots))
    }

    /// Returns every anchor, including ones whose trust window has passed.
    pub fn anchors(&self) -> &[TrustAnchor] {
        &self.anchors
    }

    /// Returns the roots trusted at `at`.
    pub fn roots_at(&self, at: DateTime<Utc>) -> Vec<&Certificate> {
        self.anchors
            .iter()
            .filter(|a| a.is_trusted_at(at))
            .map(|a| &a.cert)
            .collect()
    }

    /// Returns the roots trusted now.
    pub fn roots(&self) -> Vec<&Certificate> {
        self.roots_at(Utc::now())
    }

    /// Returns true if `cert` is one of the anchors.
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.anchors.iter().any(|a| a.cert == *cert)
    }

    /// Returns this bundle with `root` added as an indefinitely trusted
    /// anchor. Existing anchors keep their trust windows.
    pub fn with_root(&self, root: Certificate) -> Self {
        let mut anchors = self.anchors.clone();
        if !self.contains(&root) {
            anchors.push(TrustAnchor {
                cert: root,
                trusted_until: None,
            });
        }
        Self { anchors }
    }

    /// Builds the bundle that follows a root rotation.
    ///
    /// `new_root` is trusted indefinitely. Anchors still trusted at `now`
    /// remain, but no later than `overlap_until`. Expired anchors are dropped.
    pub fn rotated(
        &self,
        new_root: Certificate,
        now: DateTime<Utc>,
        overlap_until: DateTime<Utc>,
    ) -> Self {
        let mut anchors = vec![TrustAnchor {
            cert: new_root,
            trusted_until: None,
        }];
        for anchor in &self.anchors {
            if anchor.is_trusted_at(now) && anchor.cert != anchors[0].cert {
                let until = anchor
                    .trusted_until
                    .map_or(overlap_until, |t| t.min(overlap_until));
                anchors.push(TrustAnchor {
                    cert: anchor.cert.clone(),
                    trusted_until: Some(until),
                });
            }
        }
        Self { anchors }
    }

    /// Returns the roots trusted now as concatenated PEM.
    pub fn to_pem(&self) -> String {
        self.roots().into_iter().map(|c| c.to_pem()).collect()
    }

    /// Verifies a leaf certificate chain at `at` and returns its identity.
    ///
    /// `chain` is the leaf followed by any intermediates. The chain must build
    /// to an anchor trusted at `at`, every certificate must be within its
    /// validity window, and the leaf must allow client authentication.
    pub fn verify(&self, chain: &[Certificate], at: DateTime<Utc>) -> Result<Identity> {
        self.verify_for(chain, at, webpki::KeyUsage::client_auth())
    }

    pub(crate) fn verify_for(
        &self,
        chain: &[Certificate],
        at: DateTime<Utc>,
        usage: webpki::KeyUsage,
    ) -> Result<Identity> {
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or_else(|| Error::VerificationFailed("empty certificate chain".to_string()))?;

        let roots: Vec<rustls::pki_types::CertificateDer<'_>> = self
            .roots_at(at)
            .into_iter()
            .map(|c| rustls::pki_types::CertificateDer::from(c.der()))
            .collect();
        let anchors = roots
            .iter()
            .map(|der| {
                webpki::anchor_from_trusted_cert(der)
                    .map_err(|e| Error::Certificate(format!("bad trust anchor: {e:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_der = rustls::pki_types::CertificateDer::from(leaf.der());
        let intermediate_ders: Vec<rustls::pki_types::CertificateDer<'_>> = intermediates
            .iter()
            .map(|c| rustls::pki_types::CertificateDer::from(c.der()))
            .collect();

        let end_entity = webpki::EndEntityCert::try_from(&leaf_der)
            .map_err(|e| Error::Certificate(format!("failed to parse leaf: {e:?}")))?;

        let secs = u64::try_from(at.timestamp())
            .map_err(|_| Error::VerificationFailed("time before epoch".to_string()))?;
        let time = UnixTime::since_unix_epoch(std::time::Duration::from_secs(secs));

        end_entity
            .verify_for_usage(
                SUPPORTED_SIG_ALGS,
                &anchors,
                &intermediate_ders,
                time,
                usage,
                None,
                None,
            )
            .map_err(|e| Error::VerificationFailed(format!("chain verification failed: {e:?}")))?;

        leaf.spiffe_identity()
    }

    /// Converts the currently trusted roots to a rustls RootCertStore.
    pub fn to_rustls_root_store(&self) -> Result<Arc<rustls::RootCertStore>> {
        let mut store = rustls::RootCertStore::empty();
        for cert in self.roots() {
            let der = rustls::pki_types::CertificateDer::from(cert.der().to_vec());
            store
                .add(der)
                .map_err(|e| Error::Certificate(format!("failed to add root cert: {e}")))?;
        }
        Ok(Arc::new(store))
    }

    /// Returns the anchors trusted at `at`, with their trust windows.
    pub fn to_records_at(&self, at: DateTime<Utc>) -> Vec<AnchorRecord> {
        self.anchors
            .iter()
            .filter(|a| a.is_trusted_at(at))
            .map(|a| AnchorRecord {
                cert_pem: a.cert.to_pem().to_string(),
                trusted_until: a.trusted_until,
            })
            .collect()
    }

    /// Rebuilds a bundle from anchor records.
    pub fn from_records(records: Vec<AnchorRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::Certificate("trust bundle has no roots".to_string()));
        }
        let anchors = records
            .into_iter()
            .map(|a| {
                Ok(TrustAnchor {
                    cert: Certificate::from_pem(&a.cert_pem)?,
                    trusted_until: a.trusted_until,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { anchors })
    }

    /// Serializes the bundle, including trust windows, for the secret store.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let record = TrustBundleRecord {
            anchors: self
                .anchors
                .iter()
                .map(|a| AnchorRecord {
                    cert_pem: a.cert.to_pem().to_string(),
                    trusted_until: a.trusted_until,
                })
                .collect(),
        };
        serde_json::to_vec(&record)
            .map_err(|e| Error::Internal(format!("failed to encode trust bundle: {e}")))
    }

    /// Parses a bundle written by [`TrustBundle::to_json`].
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let record: TrustBundleRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::Certificate(format!("malformed trust bundle: {e}")))?;
        Self::from_records(record.anchors)
    }
}

/// Parses a PEM-encoded certificate chain.
pub fn parse_cert_chain_pem(pem_str: &str) -> Result<Vec<Certificate>> {
    let blocks = pem::parse_many(pem_str)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
    blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| {
            let cert = Certificate::from_der(b.into_contents());
            cert.parse()?;
            Ok(cert)
        })
        .collect()
}
