//! CA and node agent configuration.
//!
//! Both configs are plain serde structs loaded from TOML. Every field has a
//! default except the agent's identity, and `validate()` runs once at load
//! time so the rest of the crate can rely on the invariants it checks.

use crate::identity::{validate_trust_domain, Identity};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::csr::KeyAlgorithm;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Certificate authority configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Trust domain the CA issues identities for.
    #[serde(default = "default_trust_domain")]
    pub trust_domain: String,

    /// Generate and manage a self-signed root instead of loading signing
    /// material from files.
    #[serde(default = "default_true")]
    pub self_signed_ca: bool,

    /// Organization placed in the self-signed root's subject.
    #[serde(default = "default_org")]
    pub self_signed_ca_org: String,

    /// Signing certificate (required unless `self_signed_ca`).
    #[serde(default)]
    pub signing_cert: Option<PathBuf>,

    /// Signing key (required unless `self_signed_ca`).
    #[serde(default)]
    pub signing_key: Option<PathBuf>,

    /// Intermediates between the signing certificate and the root.
    #[serde(default)]
    pub cert_chain: Option<PathBuf>,

    /// Root certificate (required unless `self_signed_ca`).
    #[serde(default)]
    pub root_cert: Option<PathBuf>,

    /// Lifetime of self-signed root and CA-chain certificates.
    #[serde(default = "default_ca_cert_ttl")]
    pub ca_cert_ttl_secs: u64,

    /// Workload TTL used when a request asks for none.
    #[serde(default = "default_workload_cert_ttl")]
    pub workload_cert_ttl_secs: u64,

    /// Ceiling on workload certificate TTLs.
    #[serde(default = "default_max_workload_cert_ttl")]
    pub max_workload_cert_ttl_secs: u64,

    /// Reject over-long TTL requests instead of clamping them.
    #[serde(default)]
    pub strict_ttl: bool,

    /// Rotate the self-signed root once its remaining validity drops below this.
    #[serde(default = "default_root_rotation_threshold")]
    pub root_rotation_threshold_secs: u64,

    /// How long a new root is distributed in the trust bundle before it
    /// starts signing. Agents renewing at least this often all learn the new
    /// root before any certificate, the server's included, chains to it.
    #[serde(default = "default_root_activation_delay")]
    pub root_activation_delay_secs: u64,

    /// How often the rotator checks the root.
    #[serde(default = "default_rotation_check_interval")]
    pub rotation_check_interval_secs: u64,

    /// Prefix for the CA's keys in the secret store.
    #[serde(default = "default_storage_namespace")]
    pub storage_namespace: String,

    /// Directory backing the file secret store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Address the issuance server listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Service account of the CA's own serving identity.
    #[serde(default = "default_service_account")]
    pub service_account: String,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
}

fn default_trust_domain() -> String {
    "cluster.local".to_string()
}
fn default_true() -> bool {
    true
}
fn default_org() -> String {
    "cluster.local".to_string()
}
fn default_ca_cert_ttl() -> u64 {
    365 * DAY
}
fn default_workload_cert_ttl() -> u64 {
    HOUR
}
fn default_max_workload_cert_ttl() -> u64 {
    7 * DAY
}
fn default_root_rotation_threshold() -> u64 {
    30 * DAY
}
fn default_root_activation_delay() -> u64 {
    HOUR
}
fn default_rotation_check_interval() -> u64 {
    HOUR
}
fn default_storage_namespace() -> String {
    "meshca-system".to_string()
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/meshca")
}
fn default_listen_addr() -> String {
    "0.0.0.0:8060".to_string()
}
fn default_service_account() -> String {
    "meshca".to_string()
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            trust_domain: default_trust_domain(),
            self_signed_ca: true,
            self_signed_ca_org: default_org(),
            signing_cert: None,
            signing_key: None,
            cert_chain: None,
            root_cert: None,
            ca_cert_ttl_secs: default_ca_cert_ttl(),
            workload_cert_ttl_secs: default_workload_cert_ttl(),
            max_workload_cert_ttl_secs: default_max_workload_cert_ttl(),
            strict_ttl: false,
            root_rotation_threshold_secs: default_root_rotation_threshold(),
            root_activation_delay_secs: default_root_activation_delay(),
            rotation_check_interval_secs: default_rotation_check_interval(),
            storage_namespace: default_storage_namespace(),
            storage_dir: default_storage_dir(),
            listen_addr: default_listen_addr(),
            service_account: default_service_account(),
            key_algorithm: KeyAlgorithm::default(),
        }
    }
}

impl CaConfig {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        validate_trust_domain(&self.trust_domain)
            .map_err(|e| Error::Config(format!("trust_domain: {e}")))?;
        nonzero("ca_cert_ttl_secs", self.ca_cert_ttl_secs)?;
        nonzero("workload_cert_ttl_secs", self.workload_cert_ttl_secs)?;
        nonzero("rotation_check_interval_secs", self.rotation_check_interval_secs)?;

        if self.workload_cert_ttl_secs > self.max_workload_cert_ttl_secs {
            return Err(Error::Config(format!(
                "workload_cert_ttl_secs ({}) exceeds max_workload_cert_ttl_secs ({})",
                self.workload_cert_ttl_secs, self.max_workload_cert_ttl_secs
            )));
        }
        if self.root_activation_delay_secs < self.workload_cert_ttl_secs {
            return Err(Error::Config(format!(
                "root_activation_delay_secs ({}) must be at least workload_cert_ttl_secs ({})",
                self.root_activation_delay_secs, self.workload_cert_ttl_secs
            )));
        }
        // The outgoing root must outlive the activation delay plus the
        // lifetime of the last certificates it signs.
        let overlap = self
            .max_workload_cert_ttl_secs
            .saturating_add(self.root_activation_delay_secs);
        if self.root_rotation_threshold_secs < overlap {
            return Err(Error::Config(format!(
                "root_rotation_threshold_secs ({}) must be at least max_workload_cert_ttl_secs plus root_activation_delay_secs ({overlap})",
                self.root_rotation_threshold_secs
            )));
        }
        if self.self_signed_ca && self.root_rotation_threshold_secs >= self.ca_cert_ttl_secs {
            return Err(Error::Config(format!(
                "root_rotation_threshold_secs ({}) must be below ca_cert_ttl_secs ({})",
                self.root_rotation_threshold_secs, self.ca_cert_ttl_secs
            )));
        }

        if !self.self_signed_ca {
            for (name, value) in [
                ("signing_cert", &self.signing_cert),
                ("signing_key", &self.signing_key),
                ("root_cert", &self.root_cert),
            ] {
                if value.is_none() {
                    return Err(Error::Config(format!(
                        "{name} is required when self_signed_ca is false"
                    )));
                }
            }
        }

        self.server_identity()?;
        Ok(())
    }

    pub fn ca_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.ca_cert_ttl_secs)
    }

    pub fn workload_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.workload_cert_ttl_secs)
    }

    pub fn max_workload_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.max_workload_cert_ttl_secs)
    }

    pub fn root_rotation_threshold(&self) -> Duration {
        Duration::from_secs(self.root_rotation_threshold_secs)
    }

    pub fn root_activation_delay(&self) -> Duration {
        Duration::from_secs(self.root_activation_delay_secs)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_check_interval_secs)
    }

    /// Secret store key of the persisted CA signing material.
    pub fn ca_root_key(&self) -> String {
        format!("{}/ca-root", self.storage_namespace)
    }

    /// Secret store key of a generated root waiting for activation.
    pub fn pending_root_key(&self) -> String {
        format!("{}/ca-root-next", self.storage_namespace)
    }

    /// Secret store key of the persisted trust bundle.
    pub fn trust_bundle_key(&self) -> String {
        format!("{}/trust-bundle", self.storage_namespace)
    }

    /// Identity the issuance server presents to clients.
    pub fn server_identity(&self) -> Result<Identity> {
        Identity::try_new(
            self.trust_domain.clone(),
            self.storage_namespace.clone(),
            self.service_account.clone(),
        )
        .map_err(|e| Error::Config(format!("server identity: {e}")))
    }
}

/// Node agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity the agent obtains certificates for.
    pub identity: Identity,

    /// Address of the issuance server.
    #[serde(default = "default_ca_address")]
    pub ca_address: String,

    /// Organization placed in CSR subjects.
    #[serde(default = "default_org")]
    pub service_identity_org: String,

    /// TTL requested for each certificate.
    #[serde(default = "default_workload_cert_ttl")]
    pub workload_cert_ttl_secs: u64,

    /// Delay between attempts in a retry round.
    #[serde(default = "default_retry_interval")]
    pub csr_initial_retrial_interval_secs: u64,

    /// Attempts per retry round.
    #[serde(default = "default_max_retries")]
    pub csr_max_retries: u32,

    /// Percentage of a certificate's lifetime after which it is renewed.
    #[serde(default = "default_grace_percentage")]
    pub csr_grace_period_percentage: u8,

    /// Bound on each signing RPC.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Directory backing the file secret store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Platform certificate used to authenticate before the agent holds its own.
    #[serde(default)]
    pub bootstrap_cert: Option<PathBuf>,

    #[serde(default)]
    pub bootstrap_key: Option<PathBuf>,

    /// Root certificate used to verify the issuance server.
    #[serde(default)]
    pub root_cert: Option<PathBuf>,
}

fn default_ca_address() -> String {
    "127.0.0.1:8060".to_string()
}
fn default_retry_interval() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_grace_percentage() -> u8 {
    50
}
fn default_request_timeout() -> u64 {
    10
}

impl AgentConfig {
    /// Creates a config for `identity` with every other field defaulted.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ca_address: default_ca_address(),
            service_identity_org: default_org(),
            workload_cert_ttl_secs: default_workload_cert_ttl(),
            csr_initial_retrial_interval_secs: default_retry_interval(),
            csr_max_retries: default_max_retries(),
            csr_grace_period_percentage: default_grace_percentage(),
            request_timeout_secs: default_request_timeout(),
            key_algorithm: KeyAlgorithm::default(),
            storage_dir: default_storage_dir(),
            bootstrap_cert: None,
            bootstrap_key: None,
            root_cert: None,
        }
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.csr_grace_period_percentage == 0 || self.csr_grace_period_percentage >= 100 {
            return Err(Error::Config(format!(
                "csr_grace_period_percentage must be between 1 and 99, got {}",
                self.csr_grace_period_percentage
            )));
        }
        if self.csr_max_retries == 0 {
            return Err(Error::Config("csr_max_retries must be at least 1".into()));
        }
        nonzero(
            "csr_initial_retrial_interval_secs",
            self.csr_initial_retrial_interval_secs,
        )?;
        nonzero("request_timeout_secs", self.request_timeout_secs)?;
        nonzero("workload_cert_ttl_secs", self.workload_cert_ttl_secs)?;
        Ok(())
    }

    pub fn workload_cert_ttl(&self) -> Duration {
        Duration::from_secs(self.workload_cert_ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.csr_initial_retrial_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn nonzero(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_defaults() {
        let config: CaConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.workload_cert_ttl(), Duration::from_secs(3600));
        assert_eq!(config.max_workload_cert_ttl(), Duration::from_secs(7 * DAY));
        assert_eq!(config.ca_cert_ttl(), Duration::from_secs(365 * DAY));
        assert_eq!(config.root_rotation_threshold(), Duration::from_secs(30 * DAY));
        assert_eq!(config.root_activation_delay(), Duration::from_secs(HOUR));
        assert_eq!(config.ca_root_key(), "meshca-system/ca-root");
        assert_eq!(config.pending_root_key(), "meshca-system/ca-root-next");
        assert_eq!(config.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(
            config.server_identity().unwrap().to_spiffe_uri(),
            "spiffe://cluster.local/ns/meshca-system/sa/meshca"
        );
    }

    #[test]
    fn test_ca_external_material_required() {
        let config: CaConfig = toml::from_str(
            r#"
            self_signed_ca = false
            signing_cert = "/etc/meshca/ca-cert.pem"
            signing_key = "/etc/meshca/ca-key.pem"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("root_cert"), "{err}");
    }

    #[test]
    fn test_ca_rotation_threshold_covers_workload_ttl() {
        let config = CaConfig {
            root_rotation_threshold_secs: DAY,
            max_workload_cert_ttl_secs: 7 * DAY,
            ..CaConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_ca_activation_delay_covers_renewal() {
        let config = CaConfig {
            root_activation_delay_secs: 60,
            ..CaConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = CaConfig {
            root_activation_delay_secs: 24 * DAY,
            ..CaConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("root_rotation_threshold_secs"), "{err}");
    }

    #[test]
    fn test_ca_workload_ttl_within_max() {
        let config = CaConfig {
            workload_cert_ttl_secs: 8 * DAY,
            ..CaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_config_from_toml() {
        let config: AgentConfig = toml::from_str(
            r#"
            identity = "spiffe://cluster.local/ns/default/sa/web"
            csr_grace_period_percentage = 70
            key_algorithm = "ed25519"
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.identity.service_account(), "web");
        assert_eq!(config.csr_grace_period_percentage, 70);
        assert_eq!(config.csr_max_retries, 5);
        assert_eq!(config.retry_interval(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.key_algorithm, KeyAlgorithm::Ed25519);
    }

    #[test]
    fn test_agent_rejects_bad_identity() {
        let result = toml::from_str::<AgentConfig>(r#"identity = "spiffe://cluster.local/web""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_grace_bounds() {
        let identity = Identity::new("cluster.local", "default", "web");
        for bad in [0u8, 100, 150] {
            let config = AgentConfig {
                csr_grace_period_percentage: bad,
                ..AgentConfig::new(identity.clone())
            };
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.toml");
        std::fs::write(&path, "trust_domain = \"mesh.example.com\"\nstrict_ttl = true\n").unwrap();
        let config = CaConfig::load(&path).unwrap();
        assert_eq!(config.trust_domain, "mesh.example.com");
        assert!(config.strict_ttl);

        assert!(CaConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
