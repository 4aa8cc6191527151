//! TCP connect with timeout.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use apiwire_client::transport::connect_tcp;
//!
//! let stream = connect_tcp("192.168.88.1", 8728, Duration::from_secs(10)).await?;
//! ```

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ApiError, Result};

/// Open a TCP connection to `host:port`.
///
/// Nagle is disabled: sentences are small and latency bound.
///
/// # Errors
///
/// [`ApiError::Timeout`] if the connection is not established within
/// `connect_timeout`, [`ApiError::Io`] on refusal or resolution failure.
pub async fn connect_tcp(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ApiError::Timeout(format!("TCP connect to {}:{}", host, port)))??;

    stream.set_nodelay(true)?;
    debug!(host, port, "TCP connected");
    Ok(stream)
}
