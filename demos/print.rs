//! Print - run one command and dump its rows as JSON.
//!
//! This example demonstrates:
//! - Loading a connection configuration from JSON
//! - Opening a channel and streaming rows as they arrive
//! - Closing the connection gracefully
//!
//! # Running
//!
//! ```text
//! APIWIRE_CONFIG='{"host": "192.168.88.1"}' APIWIRE_PASSWORD=secret \
//!     cargo run --example print -- /interface/print
//! ```

use apiwire_client::{CommandEvent, Config, Params};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("APIWIRE_CONFIG") {
        Ok(json) => Config::from_json(&json)?,
        Err(_) => Config::default(),
    };
    let user = std::env::var("APIWIRE_USER").unwrap_or_else(|_| "admin".to_string());
    let password = std::env::var("APIWIRE_PASSWORD").unwrap_or_default();
    let operation = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/system/resource/print".to_string());

    let connection = config.connect(&user, &password).await?;
    let channel = connection.open_channel(None).await?;

    let mut handle = channel.write(&operation, Params::new());
    while let Some(event) = handle.next_event().await {
        match event {
            CommandEvent::Row(row) => println!("{}", serde_json::to_string(&row)?),
            CommandEvent::Done(rows) => eprintln!("{} rows", rows.len()),
            CommandEvent::Trap(trap) => eprintln!("trap: {}", trap),
            CommandEvent::Error(failure) => eprintln!("connection failed: {:?}", failure),
        }
    }

    connection.close(false).await?;
    Ok(())
}
