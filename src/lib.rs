//! # apiwire-client
//!
//! Async Rust client for the device API protocol: length-prefixed words
//! grouped into sentences over TCP (port 8728) or TLS (port 8729).
//!
//! ## Architecture
//!
//! - **Protocol**: word length prefixes, sentence reassembly, reply classification
//! - **Login**: challenge-response (MD5) or plain handshake before any command
//! - **Channels**: tagged command streams multiplexed over one socket; one
//!   command in flight per channel, FIFO within a channel
//!
//! ## Example
//!
//! ```ignore
//! use apiwire_client::{CommandEvent, Config, Params};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Config::new("192.168.88.1").connect("admin", "secret").await?;
//!     let channel = connection.open_channel(None).await?;
//!
//!     let mut handle = channel.write("/ip/address/print", Params::new());
//!     while let Some(event) = handle.next_event().await {
//!         match event {
//!             CommandEvent::Row(row) => println!("{:?}", row.get("address")),
//!             CommandEvent::Done(rows) => println!("{} addresses", rows.len()),
//!             CommandEvent::Trap(trap) => eprintln!("rejected: {}", trap),
//!             CommandEvent::Error(failure) => eprintln!("connection lost: {:?}", failure),
//!         }
//!     }
//!
//!     connection.close(false).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod channel;
pub mod command;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod writer;

mod config;
mod connection;

pub use auth::LoginMethod;
pub use channel::{Channel, ChannelOptions, ChannelStatus};
pub use command::{Command, CommandEvent, CommandHandle, Params};
pub use config::{Config, DEFAULT_TIMEOUT_MS};
pub use connection::Connection;
pub use error::{ApiError, AuthError, Failure};
pub use protocol::{Reply, ReplyKind, Row, Trap, TrapEntry};
pub use writer::WriterConfig;
