//! mTLS material for the supervisor endpoint.

use std::path::PathBuf;

use thiserror::Error;
use tokio::fs;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::CertsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate file not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("client CA certificate not found: {0}")]
    CaNotFound(PathBuf),

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM material loaded once at startup.
pub struct TlsMaterial {
    identity: Identity,
    client_ca: Certificate,
}

impl TlsMaterial {
    pub async fn load(certs: &CertsConfig) -> Result<Self, TlsError> {
        let cert_path = certs.resolve(&certs.cert_file);
        let key_path = certs.resolve(&certs.key_file);
        let ca_path = certs.resolve(&certs.ca_file);

        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path));
        }
        if !ca_path.exists() {
            return Err(TlsError::CaNotFound(ca_path));
        }

        let cert = fs::read(&cert_path).await?;
        let key = fs::read(&key_path).await?;
        let ca = fs::read(&ca_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert, key),
            client_ca: Certificate::from_pem(ca),
        })
    }

    /// Server-side config: presents the worker's identity and requires
    /// clients to present a certificate signed by the configured CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.client_ca.clone())
    }
}
