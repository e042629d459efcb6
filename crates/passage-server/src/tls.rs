//! TLS material loading and hot-reload.
//!
//! The certificate pair sits behind a read-write lock and is handed to
//! rustls through a `ResolvesServerCert` implementation, so the TLS stack
//! picks up a swap on the very next handshake without rebuilding the
//! listener. SIGHUP triggers [`ReloadableCert::reload`].

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_rustls::rustls::{
    self,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tracing::info;

use crate::error::ServerError;

/// A certificate pair that can be swapped at runtime.
pub struct ReloadableCert {
    cert_file: String,
    key_file: String,
    current: RwLock<Arc<CertifiedKey>>,
}

impl ReloadableCert {
    /// Load the initial pair from disk.
    pub fn load(cert_file: &str, key_file: &str) -> Result<Arc<Self>, ServerError> {
        let key = load_certified_key(cert_file, key_file)?;
        Ok(Arc::new(Self {
            cert_file: cert_file.to_string(),
            key_file: key_file.to_string(),
            current: RwLock::new(Arc::new(key)),
        }))
    }

    /// Re-read the pair from disk and swap it in atomically. In-flight
    /// handshakes keep the old pair; new handshakes see the new one.
    pub fn reload(&self) -> Result<(), ServerError> {
        let key = load_certified_key(&self.cert_file, &self.key_file)?;
        *self.current.write() = Arc::new(key);
        info!(cert = %self.cert_file, "certificates reloaded from disk");
        Ok(())
    }
}

impl std::fmt::Debug for ReloadableCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadableCert")
            .field("cert_file", &self.cert_file)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for ReloadableCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.read().clone())
    }
}

/// Build the server config used by every TLS listener: minimum TLS 1.2,
/// dynamic certificate resolution, HTTP/1.1 ALPN.
pub fn server_config(resolver: Arc<ReloadableCert>) -> Result<rustls::ServerConfig, ServerError> {
    let mut config = rustls::ServerConfig::builder_with_provider(default_provider())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| ServerError::Config(format!("TLS version error: {e}")))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn default_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn load_certified_key(cert_file: &str, key_file: &str) -> Result<CertifiedKey, ServerError> {
    let certs = load_certs(cert_file)?;
    if certs.is_empty() {
        return Err(ServerError::Config(format!(
            "no certificates found in {cert_file}"
        )));
    }
    let key = load_private_key(key_file)?;
    let signing_key = default_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| ServerError::Config(format!("unusable private key: {e}")))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok().map(|v| v.into_owned()))
        .collect();
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ServerError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Some(rustls_pemfile::Item::Sec1Key(key)) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Some(_) => continue,
            None => break,
        }
    }
    Err(ServerError::Config(format!("no private key found in {path}")))
}
