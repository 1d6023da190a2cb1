//! SPIFFE identity types and parsing.
//!
//! Workloads are named by SPIFFE IDs of the form:
//!
//! ```text
//! spiffe://trust-domain/ns/namespace/sa/service-account
//! ```
//!
//! The CA only issues certificates for identities of exactly this shape, so
//! parsing is strict: every segment is validated and other workload paths are
//! rejected.
//!
//! # Example
//!
//! ```
//! use meshca_identity::Identity;
//!
//! let id = Identity::new("cluster.local", "default", "my-service");
//! assert_eq!(id.to_spiffe_uri(), "spiffe://cluster.local/ns/default/sa/my-service");
//!
//! let parsed = Identity::from_spiffe_uri("spiffe://cluster.local/ns/default/sa/my-service").unwrap();
//! assert_eq!(parsed, id);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a whole SPIFFE ID in bytes.
const MAX_SPIFFE_ID_LEN: usize = 2048;

/// Maximum length of a single path segment or the trust domain.
const MAX_SEGMENT_LEN: usize = 253;

/// A SPIFFE identity representing a workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    trust_domain: String,
    namespace: String,
    service_account: String,
}

impl Identity {
    /// Creates a new identity with the given components.
    ///
    /// # Panics
    ///
    /// Panics if any component is invalid. Use [`Identity::try_new`] for
    /// fallible construction.
    pub fn new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Self {
        Self::try_new(trust_domain, namespace, service_account)
            .expect("invalid identity components")
    }

    /// Creates a new identity, validating every component.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpiffeUri`] if the trust domain holds
    /// characters outside `[a-z0-9.-]` or a path segment holds characters
    /// outside `[a-zA-Z0-9._-]`.
    pub fn try_new(
        trust_domain: impl Into<String>,
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Result<Self> {
        let trust_domain = trust_domain.into();
        let namespace = namespace.into();
        let service_account = service_account.into();

        validate_trust_domain(&trust_domain)?;
        validate_segment(&namespace, "namespace")?;
        validate_segment(&service_account, "service account")?;

        let id = Self {
            trust_domain,
            namespace,
            service_account,
        };
        if id.to_spiffe_uri().len() > MAX_SPIFFE_ID_LEN {
            return Err(Error::InvalidSpiffeUri(format!(
                "SPIFFE ID exceeds {MAX_SPIFFE_ID_LEN} bytes"
            )));
        }
        Ok(id)
    }

    /// Parses a SPIFFE URI of the form
    /// `spiffe://trust-domain/ns/namespace/sa/service-account`.
    pub fn from_spiffe_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("spiffe://")
            .ok_or_else(|| Error::InvalidSpiffeUri("must start with spiffe://".to_string()))?;

        let (trust_domain, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidSpiffeUri("missing workload path".to_string()))?;

        let parts: Vec<&str> = path.split('/').collect();
        match parts.as_slice() {
            ["ns", namespace, "sa", service_account] => {
                Self::try_new(trust_domain, *namespace, *service_account)
            }
            _ => Err(Error::InvalidSpiffeUri(format!(
                "expected ns/<namespace>/sa/<service-account>, got {path}"
            ))),
        }
    }

    /// Returns the SPIFFE URI representation of this identity.
    pub fn to_spiffe_uri(&self) -> String {
        format!(
            "spiffe://{}/ns/{}/sa/{}",
            self.trust_domain, self.namespace, self.service_account
        )
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Returns the namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the service account.
    pub fn service_account(&self) -> &str {
        &self.service_account
    }

    /// Checks if this identity belongs to the given trust domain.
    pub fn is_in_trust_domain(&self, trust_domain: &str) -> bool {
        self.trust_domain == trust_domain
    }
}

/// Returns the SPIFFE ID of a trust domain itself (`spiffe://<td>`), used as
/// the URI SAN of CA certificates.
pub fn trust_domain_uri(trust_domain: &str) -> Result<String> {
    validate_trust_domain(trust_domain)?;
    Ok(format!("spiffe://{trust_domain}"))
}

pub(crate) fn validate_trust_domain(trust_domain: &str) -> Result<()> {
    if trust_domain.is_empty() {
        return Err(Error::InvalidSpiffeUri("empty trust domain".to_string()));
    }
    if trust_domain.len() > MAX_SEGMENT_LEN {
        return Err(Error::InvalidSpiffeUri(format!(
            "trust domain exceeds {MAX_SEGMENT_LEN} bytes"
        )));
    }
    // Trust domains compare byte-for-byte, so only the lowercase form is valid.
    if !trust_domain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(Error::InvalidSpiffeUri(format!(
            "invalid trust domain characters: {trust_domain}"
        )));
    }
    if trust_domain.starts_with('.') || trust_domain.ends_with('.') {
        return Err(Error::InvalidSpiffeUri(format!(
            "trust domain cannot start or end with a dot: {trust_domain}"
        )));
    }
    Ok(())
}

/// Path segments may only contain `[a-zA-Z0-9._-]`, may not be empty, and
/// may not be `.`/`..` or start with a dot.
fn validate_segment(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidSpiffeUri(format!("empty {name}")));
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(Error::InvalidSpiffeUri(format!(
            "{name} exceeds {MAX_SEGMENT_LEN} bytes: {} bytes",
            value.len()
        )));
    }
    if value.starts_with('.') {
        return Err(Error::InvalidSpiffeUri(format!(
            "{name} cannot start with a dot: {value}"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        let shown = if c.is_control() {
            format!("\\x{:02x}", c as u32)
        } else {
            c.to_string()
        };
        return Err(Error::InvalidSpiffeUri(format!(
            "{name} contains invalid character '{shown}': {value}"
        )));
    }
    Ok(())
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_spiffe_uri())
    }
}

impl std::str::FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_spiffe_uri(s)
    }
}

impl TryFrom<String> for Identity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_spiffe_uri(&value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.to_spiffe_uri()
    }
}
