//! The CA's signing material.
//!
//! A [`KeyCertBundle`] holds the signing key, the signing certificate, the
//! intermediates up to (excluding) the root, and the root itself. Bundles are
//! immutable and checked for internal consistency on construction; rotating
//! signing material means building a new bundle.

use crate::certificate::{parse_cert_chain_pem, Certificate, PrivateKey};
use crate::csr::KeyAlgorithm;
use crate::identity::trust_domain_uri;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;

/// Signing key plus certificate chain used by the CA.
pub struct KeyCertBundle {
    key: PrivateKey,
    signing_cert: Certificate,
    intermediates: Vec<Certificate>,
    root: Certificate,
    not_after: DateTime<Utc>,
    issuer: Issuer<'static, KeyPair>,
}

#[derive(Serialize, Deserialize)]
struct BundleRecord {
    signing_key_pem: String,
    signing_cert_pem: String,
    #[serde(default)]
    cert_chain_pem: Vec<String>,
    root_cert_pem: String,
}

impl KeyCertBundle {
    /// Builds a bundle and validates it as of now.
    ///
    /// # Errors
    ///
    /// Fails if the key does not match the signing certificate, any link of
    /// `[signing, intermediates.., root]` is not signed by its successor, the
    /// root is not self-signed, or the signing certificate is not a CA
    /// certificate valid right now.
    pub fn new(
        key: PrivateKey,
        signing_cert: Certificate,
        intermediates: Vec<Certificate>,
        root: Certificate,
    ) -> Result<Self> {
        Self::new_at(key, signing_cert, intermediates, root, Utc::now())
    }

    /// Like [`KeyCertBundle::new`], validating the signing certificate's
    /// window at `at`.
    pub fn new_at(
        key: PrivateKey,
        signing_cert: Certificate,
        intermediates: Vec<Certificate>,
        root: Certificate,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        if !key.matches(&signing_cert)? {
            return Err(Error::Certificate(
                "signing key does not match signing certificate".to_string(),
            ));
        }
        if !signing_cert.is_ca()? {
            return Err(Error::Certificate(
                "signing certificate is not a CA certificate".to_string(),
            ));
        }

        let self_signed = signing_cert == root;
        if self_signed && !intermediates.is_empty() {
            return Err(Error::Certificate(
                "self-signed signing certificate cannot have intermediates".to_string(),
            ));
        }
        let mut path = vec![&signing_cert];
        if !self_signed {
            path.extend(intermediates.iter());
            path.push(&root);
        }
        for pair in path.windows(2) {
            pair[0].verify_signed_by(pair[1])?;
        }
        root.verify_signed_by(&root)
            .map_err(|e| Error::Certificate(format!("root is not self-signed: {e}")))?;

        if !signing_cert.is_valid_at(at)? {
            return Err(Error::Certificate(format!(
                "signing certificate is not valid at {at} (valid {} to {})",
                signing_cert.not_before()?,
                signing_cert.not_after()?
            )));
        }

        let issuer = Issuer::from_ca_cert_pem(signing_cert.to_pem(), key.key_pair()?)
            .map_err(|e| Error::Certificate(format!("failed to load issuer: {e}")))?;
        let not_after = signing_cert.not_after()?;

        Ok(Self {
            key,
            signing_cert,
            intermediates,
            root,
            not_after,
            issuer,
        })
    }

    /// Parses PEM material. `cert_chain_pem` holds intermediates between the
    /// signing certificate and the root and may be empty.
    pub fn from_pem(
        signing_cert_pem: &str,
        signing_key_pem: &str,
        cert_chain_pem: &str,
        root_cert_pem: &str,
    ) -> Result<Self> {
        Self::from_pem_at(
            signing_cert_pem,
            signing_key_pem,
            cert_chain_pem,
            root_cert_pem,
            Utc::now(),
        )
    }

    fn from_pem_at(
        signing_cert_pem: &str,
        signing_key_pem: &str,
        cert_chain_pem: &str,
        root_cert_pem: &str,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let signing_cert = Certificate::from_pem(signing_cert_pem)?;
        let key = PrivateKey::from_pem(signing_key_pem)?;
        let root = Certificate::from_pem(root_cert_pem)?;
        let intermediates = if cert_chain_pem.trim().is_empty() {
            Vec::new()
        } else {
            parse_cert_chain_pem(cert_chain_pem)?
                .into_iter()
                .filter(|c| *c != signing_cert && *c != root)
                .collect()
        };
        Self::new_at(key, signing_cert, intermediates, root, at)
    }

    /// Loads externally provisioned signing material from PEM files.
    pub async fn from_pem_files(
        signing_cert: &Path,
        signing_key: &Path,
        cert_chain: Option<&Path>,
        root_cert: &Path,
    ) -> Result<Self> {
        let read = |path: &Path| {
            let path = path.to_path_buf();
            async move {
                tokio::fs::read_to_string(&path).await.map_err(|e| {
                    Error::Config(format!("failed to read {}: {e}", path.display()))
                })
            }
        };
        let cert_pem = read(signing_cert).await?;
        let key_pem = read(signing_key).await?;
        let chain_pem = match cert_chain {
            Some(path) => read(path).await?,
            None => String::new(),
        };
        let root_pem = read(root_cert).await?;
        Self::from_pem(&cert_pem, &key_pem, &chain_pem, &root_pem)
    }

    /// Generates a self-signed root for `trust_domain` valid from `now` for `ttl`.
    pub fn generate_self_signed(
        org: &str,
        trust_domain: &str,
        ttl: Duration,
        algorithm: KeyAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let key_pair = algorithm.generate_key_pair()?;

        let mut params = CertificateParams::new(vec![])
            .map_err(|e| Error::CaSigning(format!("failed to create params: {e}")))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, org);
        dn.push(DnType::CommonName, format!("{org} Root CA"));
        params.distinguished_name = dn;

        let not_before = truncate_to_secs(now);
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_before + to_chrono(ttl)?)?;
        params.serial_number = Some(random_serial()?);

        // Path length 1 leaves room for one CA-chain intermediate.
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_san = rcgen::string::Ia5String::try_from(trust_domain_uri(trust_domain)?)
            .map_err(|e| Error::CaSigning(format!("invalid CA SAN: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(ca_san)];

        let root = params
            .self_signed(&key_pair)
            .map_err(|e| Error::CaSigning(format!("root cert generation failed: {e}")))?;
        let root = Certificate::from_der(root.der().to_vec());
        let key = PrivateKey::from_pem(&key_pair.serialize_pem())?;

        Self::new_at(key, root.clone(), Vec::new(), root, not_before)
    }

    /// Returns the signing certificate.
    pub fn signing_cert(&self) -> &Certificate {
        &self.signing_cert
    }

    /// Returns the intermediates between the signing certificate and the root.
    pub fn intermediates(&self) -> &[Certificate] {
        &self.intermediates
    }

    /// Returns the root certificate.
    pub fn root(&self) -> &Certificate {
        &self.root
    }

    /// Returns the signing key.
    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    /// Returns true when the signing certificate is the root.
    pub fn is_self_signed(&self) -> bool {
        self.signing_cert == self.root
    }

    /// Returns the signing certificate's expiry.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Returns how long the signing certificate remains valid after `at`.
    /// Negative once expired.
    pub fn remaining(&self, at: DateTime<Utc>) -> chrono::Duration {
        self.not_after - at
    }

    /// Chain to attach to certificates issued by this bundle, excluding the
    /// leaf and the root.
    pub fn issued_chain(&self) -> Vec<Certificate> {
        if self.is_self_signed() {
            return Vec::new();
        }
        std::iter::once(self.signing_cert.clone())
            .chain(self.intermediates.iter().cloned())
            .collect()
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }

    /// Encodes the bundle for the secret store.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let record = BundleRecord {
            signing_key_pem: self.key.as_pem().to_string(),
            signing_cert_pem: self.signing_cert.to_pem().to_string(),
            cert_chain_pem: self
                .intermediates
                .iter()
                .map(|c| c.to_pem().to_string())
                .collect(),
            root_cert_pem: self.root.to_pem().to_string(),
        };
        serde_json::to_vec(&record)
            .map_err(|e| Error::Internal(format!("failed to encode CA bundle: {e}")))
    }

    /// Decodes a bundle written by [`KeyCertBundle::to_json`] and validates it.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Self::from_json_at(bytes, Utc::now())
    }

    /// Like [`KeyCertBundle::from_json`], validating the signing certificate
    /// at `at`.
    pub fn from_json_at(bytes: &[u8], at: DateTime<Utc>) -> Result<Self> {
        let record: BundleRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::Certificate(format!("malformed CA bundle: {e}")))?;
        Self::from_pem_at(
            &record.signing_cert_pem,
            &record.signing_key_pem,
            &record.cert_chain_pem.concat(),
            &record.root_cert_pem,
            at,
        )
    }
}

impl std::fmt::Debug for KeyCertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCertBundle")
            .field("signing_cert", &self.signing_cert.subject().ok())
            .field("intermediates", &self.intermediates.len())
            .field("not_after", &self.not_after)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Drops the sub-second part; certificate times have second precision.
pub(crate) fn truncate_to_secs(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

pub(crate) fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CaSigning(format!("timestamp out of range: {e}")))
}

pub(crate) fn to_chrono(d: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).map_err(|e| Error::Config(format!("duration out of range: {e}")))
}

/// Random positive 128-bit serial number.
pub(crate) fn random_serial() -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| Error::CaSigning("failed to generate serial number".to_string()))?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::KeyAlgorithm;

    const DAY: Duration = Duration::from_secs(86_400);

    fn self_signed() -> KeyCertBundle {
        KeyCertBundle::generate_self_signed(
            "cluster.local",
            "cluster.local",
            DAY,
            KeyAlgorithm::EcdsaP256,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_generate_self_signed() {
        let bundle = self_signed();
        assert!(bundle.is_self_signed());
        assert!(bundle.issued_chain().is_empty());
        assert!(bundle.root().is_ca().unwrap());
        assert_eq!(
            bundle.root().spiffe_uris().unwrap(),
            vec!["spiffe://cluster.local".to_string()]
        );
        let subject = bundle.root().subject().unwrap();
        assert!(subject.contains("cluster.local Root CA"), "{subject}");

        let lifetime = bundle.not_after() - bundle.root().not_before().unwrap();
        assert_eq!(lifetime, chrono::Duration::days(1));
    }

    #[test]
    fn test_json_roundtrip_revalidates() {
        let bundle = self_signed();
        let loaded = KeyCertBundle::from_json(&bundle.to_json().unwrap()).unwrap();
        assert_eq!(loaded.root(), bundle.root());
        assert_eq!(loaded.not_after(), bundle.not_after());
    }

    #[test]
    fn test_rejects_mismatched_key() {
        let a = self_signed();
        let b = self_signed();
        let err = KeyCertBundle::new(
            b.private_key().clone(),
            a.signing_cert().clone(),
            Vec::new(),
            a.root().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_rejects_unrelated_root() {
        let a = self_signed();
        let b = self_signed();
        let result = KeyCertBundle::new(
            a.private_key().clone(),
            a.signing_cert().clone(),
            Vec::new(),
            b.root().clone(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_expired_signer() {
        let bundle = self_signed();
        let later = Utc::now() + chrono::Duration::days(2);
        let result = KeyCertBundle::new_at(
            bundle.private_key().clone(),
            bundle.signing_cert().clone(),
            Vec::new(),
            bundle.root().clone(),
            later,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_from_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = self_signed();
        let cert = dir.path().join("ca-cert.pem");
        let key = dir.path().join("ca-key.pem");
        let root = dir.path().join("root-cert.pem");
        std::fs::write(&cert, bundle.signing_cert().to_pem()).unwrap();
        std::fs::write(&key, bundle.private_key().as_pem()).unwrap();
        std::fs::write(&root, bundle.root().to_pem()).unwrap();

        let loaded = KeyCertBundle::from_pem_files(&cert, &key, None, &root)
            .await
            .unwrap();
        assert!(loaded.is_self_signed());

        let missing = dir.path().join("missing.pem");
        let err = KeyCertBundle::from_pem_files(&cert, &missing, None, &root)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", self_signed());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
