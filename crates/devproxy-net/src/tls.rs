//! On-demand leaf certificate minting for the TLS MITM path.
//!
//! Each intercepted host gets its own leaf certificate, `Subject.CN =
//! <host>`, signed by the local root CA, validity capped at 397 days (the
//! CA/Browser Forum ceiling for publicly-trusted leaf certs). Leaf configs
//! are cached per host so repeat CONNECTs to the same hostname don't
//! re-mint a certificate.

use std::collections::HashMap;
use std::sync::Arc;

use devproxy_core::ProxyError;
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::ca::RootCa;

const MAX_VALIDITY_DAYS: i64 = 397;

pub struct CertificateMinter {
    root: RootCa,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateMinter {
    pub fn new(root: RootCa) -> Self {
        Self {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn acceptor_for(&self, host: &str) -> Result<TlsAcceptor, ProxyError> {
        if let Some(config) = self.cache.lock().get(host) {
            return Ok(TlsAcceptor::from(config.clone()));
        }

        let config = self.mint(host)?;
        self.cache.lock().insert(host.to_string(), config.clone());
        Ok(TlsAcceptor::from(config))
    }

    fn mint(&self, host: &str) -> Result<Arc<ServerConfig>, ProxyError> {
        let mint = || -> anyhow::Result<Arc<ServerConfig>> {
            let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
            let mut params = CertificateParams::new(vec![host.to_string()])?;
            params.subject_alt_names = vec![SanType::DnsName(host.to_string().try_into()?)];
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, host);
            params.distinguished_name = dn;
            use chrono::Datelike;
            let today = chrono::Utc::now().date_naive();
            let expiry = today + chrono::Duration::days(MAX_VALIDITY_DAYS);
            params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
            params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);

            let leaf = params.signed_by(&key_pair, &self.root.cert, &self.root.key_pair)?;

            let cert_der = leaf.der().clone();
            let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(
                rustls_pki_types::PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
            );

            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der], key_der)?;
            Ok(Arc::new(config))
        };

        mint().map_err(|e| ProxyError::CertificateMintFailure(format!("{host}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mints_a_config_and_reuses_it_from_cache() {
        let root = RootCa::load_or_generate().await.expect("ca generation");
        let minter = CertificateMinter::new(root);
        let first = minter.acceptor_for("api.example.com");
        assert!(first.is_ok());
        let second = minter.acceptor_for("api.example.com");
        assert!(second.is_ok());
        assert_eq!(minter.cache.lock().len(), 1, "second mint for the same host should hit the cache");
    }
}
