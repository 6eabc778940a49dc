//! The locally-trusted root CA: generated once, persisted across restarts at
//! a platform-specific path (overridable via `DEV_PROXY_CA_KEY_PATH`), and
//! otherwise immutable for the process lifetime — the only state this crate
//! keeps between runs.

use std::path::PathBuf;

use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};

const ENV_OVERRIDE: &str = "DEV_PROXY_CA_KEY_PATH";
const CA_FILE_NAME: &str = "dev-proxy-ca.key";

pub struct RootCa {
    pub cert: Certificate,
    pub key_pair: KeyPair,
}

impl RootCa {
    /// Loads the root CA's private key from disk if present, or generates and
    /// persists a fresh one. The certificate itself is rebuilt from the key
    /// on every start — only the key material is persisted.
    pub async fn load_or_generate() -> anyhow::Result<Self> {
        let path = ca_key_path()?;
        if let Ok(pem) = tokio::fs::read_to_string(&path).await {
            let key_pair = KeyPair::from_pem(&pem)?;
            let cert = build_root_cert(&key_pair)?;
            return Ok(Self { cert, key_pair });
        }

        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, key_pair.serialize_pem()).await?;
        let cert = build_root_cert(&key_pair)?;
        tracing::info!(path = %path.display(), "generated a new dev-proxy root certificate authority");
        Ok(Self { cert, key_pair })
    }
}

fn build_root_cert(key_pair: &KeyPair) -> anyhow::Result<Certificate> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![rcgen::KeyUsagePurpose::KeyCertSign, rcgen::KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "dev-proxy local CA");
    dn.push(DnType::OrganizationName, "dev-proxy");
    params.distinguished_name = dn;
    let cert = params.self_signed(key_pair)?;
    Ok(cert)
}

fn ca_key_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(ENV_OVERRIDE) {
        return Ok(PathBuf::from(path));
    }
    let home = homedir::my_home()?.ok_or_else(|| anyhow::anyhow!("could not determine home directory"))?;
    Ok(home.join(".dev-proxy").join(CA_FILE_NAME))
}
