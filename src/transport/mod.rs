//! Transport module - TCP socket, optionally wrapped in TLS.
//!
//! The connection itself is generic over any `AsyncRead + AsyncWrite`
//! stream; this module only establishes one.

mod tcp;
#[cfg(feature = "tls")]
mod tls;

pub use tcp::connect_tcp;
#[cfg(feature = "tls")]
pub use tls::{connect_tls, TlsConfig, TlsConfigBuilder};
