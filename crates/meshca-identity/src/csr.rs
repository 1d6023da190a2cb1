//! Certificate Signing Request (CSR) generation and validation.
//!
//! Workloads generate their own key pair and send only the CSR. The CA side
//! parses the CSR with [`CertificateRequest::parse`], which checks proof of
//! possession and extracts the SPIFFE identity from the URI SAN.
//!
//! # Example
//!
//! ```
//! use meshca_identity::{CertificateRequest, CsrOptions};
//!
//! let options = CsrOptions::new("spiffe://cluster.local/ns/default/sa/my-service")
//!     .with_organization("cluster.local");
//! let cert_sign = options.generate().unwrap();
//!
//! assert!(cert_sign.csr().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
//! let request = CertificateRequest::parse(cert_sign.csr()).unwrap();
//! assert_eq!(request.identity().service_account(), "my-service");
//! ```

use crate::identity::Identity;
use crate::{Error, Result};
use rcgen::{KeyPair, KeyUsagePurpose, SanType};
use serde::{Deserialize, Serialize};
use std::fmt;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Key algorithm used for CA and workload key pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl KeyAlgorithm {
    /// Generates a fresh key pair for this algorithm.
    pub fn generate_key_pair(self) -> Result<KeyPair> {
        let alg = match self {
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
        };
        KeyPair::generate_for(alg)
            .map_err(|e| Error::CsrGeneration(format!("{self} key generation failed: {e}")))
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
            KeyAlgorithm::Ed25519 => "ed25519",
        };
        f.write_str(name)
    }
}

/// Options for generating a Certificate Signing Request.
#[derive(Debug, Clone)]
pub struct CsrOptions {
    /// The SPIFFE URI to include as a Subject Alternative Name (SAN).
    san: String,
    organization: Option<String>,
    common_name: Option<String>,
    algorithm: KeyAlgorithm,
    /// Request keyCertSign usage, for intermediate CA signing requests.
    ca_usage: bool,
}

impl CsrOptions {
    /// Creates new CSR options with the given SPIFFE URI as SAN.
    pub fn new(san: impl Into<String>) -> Self {
        Self {
            san: san.into(),
            organization: None,
            common_name: None,
            algorithm: KeyAlgorithm::default(),
            ca_usage: false,
        }
    }

    /// Sets the subject organization.
    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    /// Sets an optional common name for the certificate subject.
    pub fn with_common_name(mut self, cn: impl Into<String>) -> Self {
        self.common_name = Some(cn.into());
        self
    }

    /// Sets the key algorithm.
    pub fn with_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Requests certificate-signing key usage in the CSR.
    pub fn with_ca_usage(mut self) -> Self {
        self.ca_usage = true;
        self
    }

    /// Generates a key pair and a CSR signed by it.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or CSR creation fails.
    pub fn generate(&self) -> Result<CertSign> {
        let key_pair = self.algorithm.generate_key_pair()?;

        let mut params = rcgen::CertificateParams::new(vec![])
            .map_err(|e| Error::CsrGeneration(format!("failed to create params: {e}")))?;

        let san_ia5 = rcgen::string::Ia5String::try_from(self.san.clone())
            .map_err(|e| Error::CsrGeneration(format!("invalid SAN URI: {e}")))?;
        params.subject_alt_names = vec![SanType::URI(san_ia5)];

        let mut dn = rcgen::DistinguishedName::new();
        if let Some(ref org) = self.organization {
            dn.push(rcgen::DnType::OrganizationName, org.clone());
        }
        if let Some(ref cn) = self.common_name {
            dn.push(rcgen::DnType::CommonName, cn.clone());
        }
        params.distinguished_name = dn;

        if self.ca_usage {
            params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        }

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::CsrGeneration(format!("CSR serialization failed: {e}")))?;

        let csr_pem = csr
            .pem()
            .map_err(|e| Error::CsrGeneration(format!("CSR PEM encoding failed: {e}")))?;

        Ok(CertSign {
            csr: csr_pem,
            private_key: key_pair.serialize_pem(),
        })
    }
}

/// A Certificate Signing Request and its corresponding private key.
#[derive(Clone)]
pub struct CertSign {
    /// PEM-encoded Certificate Signing Request.
    csr: String,
    /// PEM-encoded private key (PKCS#8 format).
    private_key: String,
}

impl CertSign {
    /// Returns the PEM-encoded CSR.
    pub fn csr(&self) -> &str {
        &self.csr
    }

    /// Returns the PEM-encoded private key.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// Consumes self and returns the CSR and private key as a tuple.
    pub fn into_parts(self) -> (String, String) {
        (self.csr, self.private_key)
    }
}

impl fmt::Debug for CertSign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertSign")
            .field("csr", &self.csr)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// A parsed and signature-checked CSR.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    pem: String,
    identity: Identity,
    public_key: Vec<u8>,
    ca_usage: bool,
}

impl CertificateRequest {
    /// Parses a PEM-encoded CSR.
    ///
    /// The CSR signature must verify against its own public key (proof of
    /// possession) and it must carry exactly one URI SAN holding a
    /// well-formed workload SPIFFE ID.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCsr`] for structural and signature problems,
    /// [`Error::InvalidSpiffeUri`] when the URI SAN is not a workload ID.
    pub fn parse(csr_pem: &str) -> Result<Self> {
        let block = pem::parse(csr_pem)
            .map_err(|e| Error::InvalidCsr(format!("failed to parse PEM: {e}")))?;
        if block.tag() != "CERTIFICATE REQUEST" {
            return Err(Error::InvalidCsr(format!(
                "unexpected PEM label: {}",
                block.tag()
            )));
        }

        let (_, csr) = X509CertificationRequest::from_der(block.contents())
            .map_err(|e| Error::InvalidCsr(format!("failed to parse CSR: {e}")))?;

        csr.verify_signature()
            .map_err(|e| Error::InvalidCsr(format!("CSR signature verification failed: {e}")))?;

        let mut uris = Vec::new();
        let mut ca_usage = false;
        if let Some(extensions) = csr.requested_extensions() {
            for ext in extensions {
                match ext {
                    ParsedExtension::SubjectAlternativeName(san) => {
                        for name in &san.general_names {
                            if let GeneralName::URI(uri) = name {
                                uris.push(uri.to_string());
                            }
                        }
                    }
                    ParsedExtension::BasicConstraints(bc) if bc.ca => ca_usage = true,
                    ParsedExtension::KeyUsage(ku) if ku.key_cert_sign() || ku.crl_sign() => {
                        ca_usage = true
                    }
                    _ => {}
                }
            }
        }

        let uri = match uris.as_slice() {
            [uri] => uri,
            [] => {
                return Err(Error::InvalidCsr(
                    "no URI SAN found in CSR".to_string(),
                ))
            }
            _ => {
                return Err(Error::InvalidCsr(format!(
                    "expected exactly one URI SAN, found {}",
                    uris.len()
                )))
            }
        };
        let identity = Identity::from_spiffe_uri(uri)?;

        let public_key = csr
            .certification_request_info
            .subject_pki
            .subject_public_key
            .data
            .to_vec();

        Ok(Self {
            pem: csr_pem.to_string(),
            identity,
            public_key,
            ca_usage,
        })
    }

    /// Returns the original PEM text.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Returns the identity named in the URI SAN.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Returns the raw subject public key bytes.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Returns true if the CSR asks for CA capabilities (basic constraints
    /// CA=true, keyCertSign or cRLSign).
    pub fn requests_ca_usage(&self) -> bool {
        self.ca_usage
    }
}
