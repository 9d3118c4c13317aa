//! TLS certificate provisioning for the HTTPS listener.
//!
//! `custom` mode loads a user-provided cert/key pair. `self_signed` mode
//! mints a per-device CA once, persists it, and lazily mints per-SNI leaf
//! certificates signed by that CA on first use — so a client hitting the
//! appliance by IP and one hitting it by mDNS hostname each get a leaf cert
//! naming the SNI they actually asked for, rather than a single fixed name.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

const CA_CERT_PATH: &str = "/userdata/kvm/tls/ca.crt";
const CA_KEY_PATH: &str = "/userdata/kvm/tls/ca.key";

/// Holds the device CA and lazily-minted leaf certs, keyed by SNI hostname.
pub struct SniCertResolver {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl SniCertResolver {
    pub fn load_or_create() -> Result<Self> {
        let (ca_cert, ca_key) = load_or_generate_ca()?;
        Ok(Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn leaf_for(&self, name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(existing) = self.cache.lock().unwrap_or_else(|e| e.into_inner()).get(name) {
            return Ok(Arc::clone(existing));
        }

        let leaf_key = KeyPair::generate().context("failed to generate leaf key pair")?;
        let mut params = CertificateParams::new(vec![name.to_string()])
            .context("failed to build leaf cert params")?;
        params.distinguished_name.push(DnType::CommonName, name);
        if let Ok(ip) = name.parse() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        }

        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .context("failed to sign leaf certificate")?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let ca_der = CertificateDer::from(self.ca_cert.der().to_vec());
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::Pkcs8(key_der))
            .context("unsupported leaf key type")?;
        let certified = Arc::new(CertifiedKey::new(vec![cert_der, ca_der], signing_key));

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&certified));
        Ok(certified)
    }
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or("localhost");
        self.leaf_for(name).ok()
    }
}

fn load_or_generate_ca() -> Result<(rcgen::Certificate, KeyPair)> {
    if let (Ok(cert_pem), Ok(key_pem)) = (
        std::fs::read_to_string(CA_CERT_PATH),
        std::fs::read_to_string(CA_KEY_PATH),
    ) {
        if let Ok(key_pair) = KeyPair::from_pem(&key_pem) {
            let params = CertificateParams::from_ca_cert_pem(&cert_pem)
                .context("failed to parse persisted CA cert")?;
            if let Ok(cert) = params.self_signed(&key_pair) {
                tracing::info!("Loaded existing device CA from {CA_CERT_PATH}");
                return Ok((cert, key_pair));
            }
        }
        tracing::warn!("Persisted device CA invalid, regenerating");
    }

    tracing::info!("Generating new device CA for self-signed TLS");
    let mut params = CertificateParams::new(Vec::<String>::new())
        .context("failed to build CA cert params")?;
    params
        .distinguished_name
        .push(DnType::CommonName, "kvmd device CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key_pair = KeyPair::generate().context("failed to generate CA key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign CA certificate")?;

    if let Some(dir) = std::path::Path::new(CA_CERT_PATH).parent() {
        std::fs::create_dir_all(dir).context("failed to create TLS directory")?;
    }
    std::fs::write(CA_CERT_PATH, cert.pem()).context("failed to persist CA cert")?;
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(CA_KEY_PATH)
            .context("failed to open CA key file")?;
        f.write_all(key_pair.serialize_pem().as_bytes())?;
    }

    Ok((cert, key_pair))
}

/// Build a `rustls::ServerConfig` for `custom` TLS mode from a fixed cert/key
/// file pair.
pub fn custom_tls_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS cert: {cert_path}"))?;
    let key_pem =
        std::fs::read(key_path).with_context(|| format!("failed to read TLS key: {key_path}"))?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse TLS certificate PEM")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("failed to parse TLS private key PEM")?
        .context("no private key found in PEM file")?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build custom TLS server config")
}

/// Build a `rustls::ServerConfig` for `self_signed` TLS mode, resolving certs
/// per-SNI via `SniCertResolver`.
pub fn self_signed_tls_config() -> Result<ServerConfig> {
    let resolver = Arc::new(SniCertResolver::load_or_create()?);
    Ok(ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver))
}

pub fn make_acceptor(config: ServerConfig) -> tokio_rustls::TlsAcceptor {
    tokio_rustls::TlsAcceptor::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (rcgen::Certificate, KeyPair) {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params
            .distinguished_name
            .push(DnType::CommonName, "test CA");
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        (cert, key_pair)
    }

    #[test]
    fn leaf_certs_are_cached_per_name() {
        let (ca_cert, ca_key) = test_ca();
        let resolver = SniCertResolver {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        };

        let first = resolver.leaf_for("192.168.1.10").unwrap();
        let second = resolver.leaf_for("192.168.1.10").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = resolver.leaf_for("kvm.local").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
