//! Connection configuration.
//!
//! [`Config`] is plain data: it can be built fluently or loaded from JSON.
//! Writer tuning and TLS material are runtime-only and never serialized.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use apiwire_client::Config;
//!
//! let config = Config::new("192.168.88.1")
//!     .timeout(Duration::from_secs(5))
//!     .close_on_done(true);
//! assert_eq!(config.port(), 8728);
//!
//! let loaded = Config::from_json(r#"{"host": "10.0.0.1", "port": 18728}"#).unwrap();
//! assert_eq!(loaded.port(), 18728);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::LoginMethod;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{DEFAULT_MAX_WORD_SIZE, DEFAULT_PORT};
use crate::writer::WriterConfig;

#[cfg(feature = "tls")]
use crate::protocol::DEFAULT_TLS_PORT;
#[cfg(feature = "tls")]
use crate::transport::TlsConfig;

/// Default connect + login timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Settings for one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device host name or address.
    pub host: String,
    /// Port; 8728 by default, 8729 when TLS is configured.
    pub port: Option<u16>,
    /// Connect and login timeout in milliseconds.
    pub timeout_ms: u64,
    /// Close the connection when no data arrives for this long.
    pub read_timeout_ms: Option<u64>,
    /// How credentials are presented.
    pub login_method: LoginMethod,
    /// Largest inbound word accepted.
    pub max_word_size: u32,
    /// Send `/quit` once the last channel closed.
    pub close_on_done: bool,
    /// Outbound writer tuning.
    #[serde(skip)]
    pub writer: WriterConfig,
    /// TLS settings; plain TCP when unset.
    #[cfg(feature = "tls")]
    #[serde(skip)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            read_timeout_ms: None,
            login_method: LoginMethod::default(),
            max_word_size: DEFAULT_MAX_WORD_SIZE,
            close_on_done: false,
            writer: WriterConfig::default(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl Config {
    /// Configuration for `host` with defaults elsewhere.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port_number(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the connect + login timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    /// Set the idle read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Set the login method.
    pub fn login_method(mut self, method: LoginMethod) -> Self {
        self.login_method = method;
        self
    }

    /// Set the largest inbound word accepted.
    pub fn max_word_size(mut self, size: u32) -> Self {
        self.max_word_size = size;
        self
    }

    /// Send `/quit` once the last channel closed.
    pub fn close_on_done(mut self, value: bool) -> Self {
        self.close_on_done = value;
        self
    }

    /// Set the maximum pending sentences for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_sentences(mut self, limit: usize) -> Self {
        self.writer.max_pending_sentences = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer.backpressure_timeout = timeout;
        self
    }

    /// Connect over TLS.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Effective port.
    pub fn port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return DEFAULT_TLS_PORT;
        }
        DEFAULT_PORT
    }

    /// Connect + login timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Idle read timeout, if any.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }

    /// Connect and log in.
    pub async fn connect(&self, username: &str, password: &str) -> Result<Connection> {
        Connection::connect(self.clone(), username, password).await
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
