//! TLS client and server configuration

use crate::{RelayError, RelayResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Client-side TLS settings for north endpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsClientConfig {
    /// Extra PEM trust anchors on top of the webpki roots
    #[serde(default)]
    pub trusted_ca_certs: Vec<PathBuf>,
}

impl TlsClientConfig {
    pub fn with_trusted_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_ca_certs.push(path.into());
        self
    }

    /// Build a connector trusting the webpki roots plus the configured CAs
    pub fn build_connector(&self) -> RelayResult<TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        for path in &self.trusted_ca_certs {
            debug!("Adding trusted certfile {}", path.display());
            let certs = load_certs(path)?;
            let (added, ignored) = roots.add_parsable_certificates(certs);
            if added == 0 {
                return Err(RelayError::Tls(format!(
                    "No usable certificates in {} ({} ignored)",
                    path.display(),
                    ignored
                )));
            }
        }

        let client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(TlsConnector::from(Arc::new(client_crypto)))
    }
}

/// Build an acceptor for a tunnel listener from PEM cert and key files
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> RelayResult<TlsAcceptor> {
    ensure_crypto_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_crypto)))
}

/// Parse a DNS name or IP literal for SNI and verification
pub fn server_name(host: &str) -> RelayResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| RelayError::Tls(format!("Invalid server name {}: {}", host, e)))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> RelayResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| RelayError::Tls(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> RelayResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| RelayError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| RelayError::Tls("No private key found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connector_builds() {
        let config = TlsClientConfig::default();
        assert!(config.build_connector().is_ok());
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsClientConfig::default().with_trusted_ca("/nonexistent/ca.pem");
        assert!(matches!(config.build_connector(), Err(RelayError::Tls(_))));
    }

    #[test]
    fn test_missing_server_cert() {
        let result = build_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(matches!(result, Err(RelayError::Tls(_))));
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
