//! # TLS for `wss://` listeners
//!
//! Loads a PEM certificate chain and private key into a rustls server
//! configuration and wraps it in a [`TlsAcceptor`].
//!
//! PKCS#8, PKCS#1 (RSA) and SEC1 (EC) keys are accepted; the first key found
//! in the file is used.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, read_all, Item};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::{ProtocolError, Result};

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert_path: String,
    key_path: String,
}

impl TlsServerConfig {
    pub fn new<P: AsRef<std::path::Path>>(cert_path: P, key_path: P) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_string_lossy().to_string(),
            key_path: key_path.as_ref().to_string_lossy().to_string(),
        }
    }

    /// Paths from the runtime configuration, if both are set
    pub fn from_runtime_config(config: &RuntimeConfig) -> Option<Self> {
        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) if config.tls_configured() => Some(Self::new(cert, key)),
            _ => None,
        }
    }

    /// Load the TLS configuration from files
    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_file = File::open(&self.cert_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);
        let cert_chain: Vec<Certificate> = certs(&mut cert_reader)
            .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?
            .into_iter()
            .map(Certificate)
            .collect();
        if cert_chain.is_empty() {
            return Err(ProtocolError::TlsError("No certificates found".into()));
        }

        let key_file = File::open(&self.key_path)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let private_key = read_all(&mut key_reader)
            .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
                _ => None,
            })
            .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?;

        debug!(cert = %self.cert_path, "TLS server config loaded");
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}
