//! TLS configuration for JobGrid connections.
//!
//! Drivers terminate TLS with [`crate::ssl_handler::SslHandler`] on their multiplexed
//! channels; nodes and clients connect through [`TlsConnector`]. Mutual TLS is enabled
//! when the server config requires client certificates signed by the grid CA.

use crate::error::{Result, TransportError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// PEM material for one side of a TLS connection.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// PEM-encoded CA certificate for verifying peer certificates.
    pub ca_cert_pem: Vec<u8>,
    /// PEM-encoded certificate chain. Empty on clients that do not present one.
    pub cert_chain_pem: Vec<u8>,
    /// PEM-encoded private key matching the chain.
    pub private_key_pem: Vec<u8>,
    /// Servers only: demand a client certificate signed by the CA.
    pub require_client_auth: bool,
}

impl TlsConfig {
    pub fn new(
        ca_cert_pem: Vec<u8>,
        cert_chain_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
        require_client_auth: bool,
    ) -> Self {
        Self {
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        }
    }

    /// Loads the PEM files from disk. `cert` and `key` may be omitted on clients.
    pub fn from_files(
        ca: &Path,
        cert: Option<&Path>,
        key: Option<&Path>,
        require_client_auth: bool,
    ) -> Result<Self> {
        let ca_cert_pem = std::fs::read(ca)?;
        let cert_chain_pem = match cert {
            Some(path) => std::fs::read(path)?,
            None => Vec::new(),
        };
        let private_key_pem = match key {
            Some(path) => std::fs::read(path)?,
            None => Vec::new(),
        };
        Ok(Self::new(
            ca_cert_pem,
            cert_chain_pem,
            private_key_pem,
            require_client_auth,
        ))
    }

    fn has_identity(&self) -> bool {
        !self.cert_chain_pem.is_empty() && !self.private_key_pem.is_empty()
    }
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn root_store(ca_pem: &[u8]) -> Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in load_certs_from_pem(ca_pem)? {
        roots.add(cert).map_err(|e| TransportError::TlsError {
            reason: format!("failed to add CA cert: {}", e),
        })?;
    }
    Ok(roots)
}

/// Builds the rustls server configuration used by driver listeners.
pub fn server_config(config: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    install_provider();
    let certs = load_certs_from_pem(&config.cert_chain_pem)?;
    let key = load_private_key_from_pem(&config.private_key_pem)?;

    let builder = rustls::ServerConfig::builder();
    let builder = if config.require_client_auth {
        let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(&config.ca_cert_pem)?))
            .build()
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to build client verifier: {}", e),
            })?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let server_config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::TlsError {
            reason: format!("failed to set server cert: {}", e),
        })?;
    Ok(Arc::new(server_config))
}

/// Builds the rustls client configuration used by nodes and clients.
pub fn client_config(config: &TlsConfig) -> Result<Arc<rustls::ClientConfig>> {
    install_provider();
    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store(&config.ca_cert_pem)?);

    let client_config = if config.has_identity() {
        let certs = load_certs_from_pem(&config.cert_chain_pem)?;
        let key = load_private_key_from_pem(&config.private_key_pem)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::TlsError {
                reason: format!("failed to create client config: {}", e),
            })?
    } else {
        builder.with_no_client_auth()
    };
    Ok(Arc::new(client_config))
}

/// Parses a host name or IP address into a rustls server name.
pub fn server_name(domain: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(domain.to_string()).map_err(|e| TransportError::TlsError {
        reason: format!("invalid domain: {}", e),
    })
}

/// Client-side TLS connector for async streams.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

impl TlsConnector {
    pub fn new(config: &TlsConfig) -> Result<Self> {
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(client_config(config)?),
        })
    }

    /// Performs the client handshake over an established stream.
    pub async fn connect<IO>(
        &self,
        domain: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let name = server_name(domain)?;
        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::TlsError {
                reason: format!("TLS handshake failed: {}", e),
            })
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cursor)
        .filter_map(|cert| cert.ok())
        .collect();

    if certs.is_empty() {
        return Err(TransportError::TlsError {
            reason: "no certificates found in PEM".to_string(),
        });
    }

    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    match rustls_pemfile::private_key(&mut cursor) {
        Ok(Some(key)) => Ok(key),
        _ => Err(TransportError::TlsError {
            reason: "no private key found in PEM".to_string(),
        }),
    }
}

/// Generates a self-signed CA certificate and key pair using rcgen.
///
/// Returns (CA certificate PEM, CA key PEM).
pub fn generate_self_signed_ca() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| TransportError::TlsError {
        reason: format!("failed to generate CA key: {}", e),
    })?;

    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "jobgrid CA");

    let cert = params.self_signed(&key_pair).map_err(|e| TransportError::TlsError {
        reason: format!("failed to create CA certificate: {}", e),
    })?;

    Ok((cert.pem().into_bytes(), key_pair.serialize_pem().into_bytes()))
}

/// Generates a certificate for `host_name` signed by the grid CA.
///
/// Returns (certificate PEM, key PEM).
pub fn generate_signed_cert(
    ca_cert_pem: &[u8],
    ca_key_pem: &[u8],
    host_name: &str,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let tls_err = |what: &str, e: &dyn fmt::Display| TransportError::TlsError {
        reason: format!("{}: {}", what, e),
    };

    let ca_key_str = std::str::from_utf8(ca_key_pem).map_err(|e| tls_err("invalid CA key PEM", &e))?;
    let ca_key = rcgen::KeyPair::from_pem(ca_key_str).map_err(|e| tls_err("failed to parse CA key", &e))?;

    let ca_cert_str =
        std::str::from_utf8(ca_cert_pem).map_err(|e| tls_err("invalid CA cert PEM", &e))?;
    let ca_params = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_str)
        .map_err(|e| tls_err("failed to parse CA certificate", &e))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| tls_err("failed to reconstruct CA certificate", &e))?;

    let key = rcgen::KeyPair::generate().map_err(|e| tls_err("failed to generate key", &e))?;
    let params = rcgen::CertificateParams::new(vec![host_name.to_string()])
        .map_err(|e| tls_err("failed to create certificate params", &e))?;
    let cert = params
        .signed_by(&key, &ca_cert, &ca_key)
        .map_err(|e| tls_err("failed to sign certificate", &e))?;

    Ok((cert.pem().into_bytes(), key.serialize_pem().into_bytes()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Server and client configs for "localhost" sharing one CA.
    pub fn localhost_configs(mutual: bool) -> (TlsConfig, TlsConfig) {
        let (ca_cert, ca_key) = generate_self_signed_ca().unwrap();
        let (server_cert, server_key) = generate_signed_cert(&ca_cert, &ca_key, "localhost").unwrap();
        let (client_cert, client_key) = generate_signed_cert(&ca_cert, &ca_key, "node").unwrap();
        let server = TlsConfig::new(ca_cert.clone(), server_cert, server_key, mutual);
        let client = TlsConfig::new(ca_cert, client_cert, client_key, false);
        (server, client)
    }
}
