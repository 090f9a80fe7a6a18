//! Certificate loading and mTLS configuration.
//!
//! The service is mTLS-only: the server presents an identity signed by the
//! shared authority and requires clients to do the same. The client
//! certificate's Common Name is the owner identity used for authorization
//! (see `grpc::service`).

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

/// Domain name baked into client connections; certificate validation is
/// anchored on the shared CA, not on hostnames.
pub const TLS_DOMAIN: &str = "jobworker";

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("certificate path not configured")]
    MissingCert,

    #[error("private key path not configured")]
    MissingKey,

    #[error("TLS file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to read TLS file: {0}")]
    Io(#[from] std::io::Error),
}

/// Loaded TLS materials for one side of the connection: this process's
/// identity plus the CA that vouches for the peer.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    /// Load TLS materials from the file paths in the config.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_path = config.ca_cert_path.as_ref().ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        for path in [ca_path, cert_path, key_path] {
            if !path.exists() {
                return Err(TlsError::FileNotFound(path.clone()));
            }
        }

        let ca_pem = fs::read(ca_path).await?;
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server-side config: present our identity and require a client
    /// certificate verified against the CA. Connections without a valid
    /// client certificate fail at the handshake, before any RPC runs.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client-side config: present our identity and verify the server
    /// against the CA.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(TLS_DOMAIN)
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}
