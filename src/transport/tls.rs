//! TLS transport (feature `tls`).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{ApiError, Result};

/// TLS client settings.
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) client_config: Arc<ClientConfig>,
    /// Name checked against the device certificate; the host is used when unset.
    pub(crate) server_name: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Use a prepared rustls client configuration.
    pub fn new(client_config: Arc<ClientConfig>) -> Self {
        Self {
            client_config,
            server_name: None,
        }
    }

    /// Creates a new TLS configuration builder.
    #[must_use]
    pub const fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Override the name used for certificate verification.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Creates a TLS connector.
    #[must_use]
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config.clone())
    }
}

/// Builder for [`TlsConfig`] from PEM material.
#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_cert_pem: Option<Vec<u8>>,
    server_name: Option<String>,
}

impl TlsConfigBuilder {
    /// Creates a new TLS configuration builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ca_cert_pem: None,
            server_name: None,
        }
    }

    /// Sets the CA certificate(s) the device certificate must chain to.
    #[must_use]
    pub fn ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Sets the name checked against the device certificate.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Builds the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA certificate is missing or invalid.
    pub fn build(self) -> Result<TlsConfig> {
        let ca_pem = self
            .ca_cert_pem
            .ok_or_else(|| ApiError::Tls("CA certificate required".into()))?;

        let ca_certs = CertificateDer::pem_slice_iter(&ca_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ApiError::Tls(format!("failed to parse certificates: {e}")))?;
        if ca_certs.is_empty() {
            return Err(ApiError::Tls("no CA certificates found".into()));
        }

        let mut root_store = RootCertStore::empty();
        for cert in ca_certs {
            root_store
                .add(cert)
                .map_err(|e| ApiError::Tls(format!("failed to add CA certificate: {e}")))?;
        }

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(TlsConfig {
            client_config: Arc::new(client_config),
            server_name: self.server_name,
        })
    }
}

/// Perform the TLS handshake over an established TCP stream.
///
/// # Errors
///
/// [`ApiError::Timeout`] when the handshake does not finish within
/// `handshake_timeout`, [`ApiError::Tls`] for an invalid server name or a
/// failed handshake.
pub async fn connect_tls(
    stream: TcpStream,
    host: &str,
    config: &TlsConfig,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let name = config.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_owned())
        .map_err(|e| ApiError::Tls(format!("invalid server name: {e}")))?;

    let tls_stream = timeout(handshake_timeout, config.connector().connect(server_name, stream))
        .await
        .map_err(|_| ApiError::Timeout("TLS handshake".into()))?
        .map_err(|e| ApiError::Tls(format!("TLS handshake failed: {e}")))?;

    debug!(server_name = name, "TLS established");
    Ok(tls_stream)
}
