//! Writes credentials to disk for workloads that read PEM files.

use anyhow::{Context, Result};
use meshca_identity::{IssuedCertificate, PrivateKey};
use std::path::Path;

pub const CERT_CHAIN_FILE: &str = "cert-chain.pem";
pub const KEY_FILE: &str = "key.pem";
pub const ROOT_CERT_FILE: &str = "root-cert.pem";

/// Writes the chain, key and root into `dir`. Each file is replaced by
/// rename so readers never see a partial write. The key is readable by the
/// owner only.
pub async fn write_credential(
    dir: &Path,
    cert: &IssuedCertificate,
    key: &PrivateKey,
) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    write_atomic(&dir.join(KEY_FILE), key.as_pem().as_bytes(), 0o600).await?;
    write_atomic(&dir.join(CERT_CHAIN_FILE), cert.chain_pem().as_bytes(), 0o644).await?;
    write_atomic(&dir.join(ROOT_CERT_FILE), cert.root_pem().as_bytes(), 0o644).await?;
    Ok(())
}

async fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = opts
        .open(&tmp)
        .await
        .with_context(|| format!("failed to open {}", tmp.display()))?;
    tokio::io::AsyncWriteExt::write_all(&mut file, contents)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to rename onto {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshca_identity::{
        CaPolicy, CertificateAuthority, CsrOptions, KeyAlgorithm, KeyCertBundle, SigningRequest,
        TrustBundle,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_credential() {
        let bundle = KeyCertBundle::generate_self_signed(
            "cluster.local",
            "cluster.local",
            Duration::from_secs(86_400),
            KeyAlgorithm::EcdsaP256,
            chrono::Utc::now(),
        )
        .unwrap();
        let trust = TrustBundle::new(vec![bundle.root().clone()]);
        let ca = CertificateAuthority::with_bundle(
            CaPolicy {
                trust_domain: "cluster.local".into(),
                workload_cert_ttl: Duration::from_secs(3600),
                max_workload_cert_ttl: Duration::from_secs(3600),
                ca_cert_ttl: Duration::from_secs(86_400),
                strict_ttl: false,
            },
            bundle,
            trust,
        );
        let cert_sign = CsrOptions::new("spiffe://cluster.local/ns/default/sa/web")
            .generate()
            .unwrap();
        let cert = ca
            .sign(&SigningRequest::Workload {
                csr: cert_sign.csr().to_string(),
                ttl: Duration::ZERO,
            })
            .unwrap();
        let key = PrivateKey::from_pem(cert_sign.private_key()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("web");
        write_credential(&out, &cert, &key).await.unwrap();

        let chain = std::fs::read_to_string(out.join(CERT_CHAIN_FILE)).unwrap();
        let root = std::fs::read_to_string(out.join(ROOT_CERT_FILE)).unwrap();
        let reread = IssuedCertificate::from_pem(&chain, &root).unwrap();
        assert_eq!(reread.leaf(), cert.leaf());
        assert_eq!(
            std::fs::read_to_string(out.join(KEY_FILE)).unwrap(),
            key.as_pem()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(out.join(KEY_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
