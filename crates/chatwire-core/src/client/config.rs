//! Client configuration.
//!
//! Loaded from TOML. Every section is optional; missing fields take their
//! defaults. Durations are stored as milliseconds.
//!
//! ```toml
//! [connection]
//! endpoints = ["wss://chat.example.net/ws", "wss://chat-backup.example.net/ws"]
//! heartbeat_interval_ms = 20000
//!
//! [reconnect]
//! max_attempts = 5
//! jitter = true
//!
//! [storage]
//! key_dir = "/var/lib/chatwire/keys"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Configuration could not be serialized
    #[error("config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range or malformed
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// Outbound queue
    pub queue: QueueConfig,
    /// Key and session storage
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server endpoints, tried in order
    pub endpoints: Vec<String>,
    /// Per-endpoint connect timeout
    pub connect_timeout_ms: u64,
    /// Time allowed for the handshake and authentication exchange
    pub auth_timeout_ms: u64,
    /// Interval between pings while connected
    pub heartbeat_interval_ms: u64,
    /// Deadline for the pong answering a ping
    pub pong_timeout_ms: u64,
    /// Handshake prologue (hex)
    pub prologue: String,
    /// Expected server static key (hex); the handshake fails on mismatch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_static_key: Option<String>,
}

/// Reconnect policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect
    pub base_delay_ms: u64,
    /// Upper bound on the delay
    pub max_delay_ms: u64,
    /// Attempts after which the client gives up
    pub max_attempts: u32,
    /// Stretch each delay by up to 25% at random
    pub jitter: bool,
}

/// Outbound queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Minimum time between two outbound messages
    pub min_spacing_ms: u64,
    /// Pending items before `submit` waits; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

/// Key and session storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the key files
    pub key_dir: PathBuf,
    /// Encrypted session file
    pub session_path: PathBuf,
    /// Session file key (64 hex chars)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    /// Passphrase that encrypts key files at rest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    /// Include the event target in output
    pub with_target: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["wss://chat.example.net/ws".to_string()],
            connect_timeout_ms: 20_000,
            auth_timeout_ms: 20_000,
            heartbeat_interval_ms: 25_000,
            pong_timeout_ms: 10_000,
            prologue: hex::encode(DEFAULT_PROLOGUE),
            server_static_key: None,
        }
    }
}

/// Prologue mixed into the handshake transcript: `"CW"`, major, minor.
pub const DEFAULT_PROLOGUE: &[u8] = b"CW\x01\x00";

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_spacing_ms: 1_000,
            capacity: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("chatwire/keys"),
            session_path: PathBuf::from("chatwire/session.bin"),
            session_key: None,
            key_passphrase: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

impl ConnectionConfig {
    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Auth timeout as a `Duration`
    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Heartbeat interval as a `Duration`
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Pong timeout as a `Duration`
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    /// Decoded prologue.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the prologue is not hex.
    pub fn prologue_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        hex::decode(&self.prologue)
            .map_err(|e| ConfigError::Invalid(format!("connection.prologue: {e}")))
    }

    /// Decoded pinned server key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] unless the key is 64 hex chars.
    pub fn server_static_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        self.server_static_key
            .as_deref()
            .map(|key| decode_key("connection.server_static_key", key))
            .transpose()
    }
}

impl ReconnectConfig {
    /// Base delay as a `Duration`
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay cap as a `Duration`
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl QueueConfig {
    /// Minimum spacing as a `Duration`
    #[must_use]
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(self.min_spacing_ms)
    }
}

impl StorageConfig {
    /// Decoded session file key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] unless the key is 64 hex chars.
    pub fn session_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        self.session_key
            .as_deref()
            .map(|key| decode_key("storage.session_key", key))
            .transpose()
    }
}

/// Decode a 32-byte key from 64 hex chars.
pub(crate) fn decode_key(field: &str, value: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ConfigError::Invalid(format!("{field}: expected 32 bytes, got {}", bytes.len())))
}

impl ClientConfig {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;

        if conn.endpoints.is_empty() {
            return Err(ConfigError::Invalid("connection.endpoints is empty".into()));
        }
        for endpoint in &conn.endpoints {
            if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "endpoint '{endpoint}' must use ws:// or wss://"
                )));
            }
        }

        for (name, value) in [
            ("connection.connect_timeout_ms", conn.connect_timeout_ms),
            ("connection.auth_timeout_ms", conn.auth_timeout_ms),
            ("connection.heartbeat_interval_ms", conn.heartbeat_interval_ms),
            ("connection.pong_timeout_ms", conn.pong_timeout_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }

        if conn.pong_timeout_ms >= conn.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "connection.pong_timeout_ms must be less than heartbeat_interval_ms".into(),
            ));
        }
        conn.prologue_bytes()?;
        conn.server_static_key_bytes()?;

        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms exceeds max_delay_ms".into(),
            ));
        }

        if self.queue.capacity == Some(0) {
            return Err(ConfigError::Invalid("queue.capacity must be non-zero".into()));
        }

        self.storage.session_key_bytes()?;
        if self.storage.key_passphrase.as_deref() == Some("") {
            return Err(ConfigError::Invalid("storage.key_passphrase is empty".into()));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !self.logging.level.contains('=')
            && !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str())
        {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        Ok(())
    }
}
