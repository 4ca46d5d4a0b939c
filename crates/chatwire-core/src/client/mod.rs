//! Session client for chatwire
//!
//! This module ties the codec and the crypto layer into a long-lived client:
//! - Noise handshake and login/registration over a [`Transport`](chatwire_transport::Transport)
//! - Heartbeat and exponential-backoff reconnection across endpoints
//! - Encrypted persistence of keys and the resumable session
//! - Paced delivery of outbound messages
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  ConnectionManager                      │
//! │   (state machine, reconnect loop, event dispatch)       │
//! ├──────────────┬──────────────┬──────────────┬────────────┤
//! │ OutboundQueue│  Handshake   │ SessionStore │  KeyStore  │
//! ├──────────────┴──────────────┴──────────────┴────────────┤
//! │       Binary codec  │  CipherState / Ratchet            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chatwire_core::client::{ClientConfig, ConnectionManager};
//! use chatwire_transport::WebSocketConnector;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::load("chatwire.toml")?;
//!     let connector = Arc::new(WebSocketConnector::new(config.connection.connect_timeout()));
//!     let (client, mut events) = ConnectionManager::open(config, connector)?;
//!
//!     client.connect().await?;
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod handshake;
pub mod keystore;
pub mod queue;
pub mod session_store;

pub use backoff::Backoff;
pub use config::{ClientConfig, ConfigError};
pub use connection::ConnectionManager;
pub use error::ClientError;
pub use events::{ClientEvent, PairingPayload};
pub use keystore::{IdentityKeys, KeyStore, PreKey, SignedPreKey};
pub use queue::{ActionSink, OutboundAction, OutboundQueue, QueueError};
pub use session_store::{SessionRecord, SessionStore};

use std::fs;
use std::io::Write;
use std::path::Path;

/// Current time in unix seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Write `contents` to `path` via `<path>.tmp`, fsync and rename.
///
/// The file is created owner-only on unix.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp = Path::new(&tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(tmp, path)
}
