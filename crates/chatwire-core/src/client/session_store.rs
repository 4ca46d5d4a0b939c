//! Encrypted persistence of the resumable session.
//!
//! ## File Format
//!
//! ```text
//! +----------------+-----------------------------+----------------+
//! | Nonce (12B)    | AES-256-GCM(JSON record)    | Tag (16B)      |
//! +----------------+-----------------------------+----------------+
//! ```
//!
//! Writes go to `<path>.tmp`, are synced, then renamed over `<path>`.

use super::config::{StorageConfig, decode_key};
use super::error::{ClientError, Result};
use super::{unix_now, write_private_file};
use crate::logging::RedactedBytes;
use chatwire_crypto::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Environment variable consulted for the session file key.
pub const SESSION_KEY_ENV: &str = "CHATWIRE_SESSION_KEY";

/// Records older than this are discarded.
pub const SESSION_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// The persisted, resumable session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Client id sent with every login
    pub client_id: String,
    /// Token issued by the server
    #[serde(default)]
    pub server_token: Option<String>,
    /// Token the client presents on resume
    #[serde(default)]
    pub client_token: Option<String>,
    /// Server static key seen during the handshake
    #[serde(default)]
    pub remote_identity: Option<[u8; 32]>,
    /// Account id assigned on pairing
    #[serde(default)]
    pub wid: Option<String>,
    /// [`KeyStore::export_all`](super::keystore::KeyStore::export_all) output
    #[serde(with = "base64_bytes")]
    pub key_export: Vec<u8>,
    /// Last update (unix seconds)
    pub last_updated: u64,
}

impl SessionRecord {
    /// Fresh record stamped now.
    #[must_use]
    pub fn new(client_id: impl Into<String>, key_export: Vec<u8>) -> Self {
        Self {
            client_id: client_id.into(),
            server_token: None,
            client_token: None,
            remote_identity: None,
            wid: None,
            key_export,
            last_updated: unix_now(),
        }
    }

    /// Whether the record can be used for a resume login.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        self.server_token.is_some() && self.client_token.is_some()
    }

    /// Stamp `last_updated` with the current time.
    pub fn touch(&mut self) {
        self.last_updated = unix_now();
    }

    /// Whether the record is older than `max_age_secs` at `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64, max_age_secs: u64) -> bool {
        now.saturating_sub(self.last_updated) > max_age_secs
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("client_id", &self.client_id)
            .field("server_token", &self.server_token.as_ref().map(|_| "[REDACTED]"))
            .field("client_token", &self.client_token.as_ref().map(|_| "[REDACTED]"))
            .field("wid", &self.wid)
            .field("key_export", &RedactedBytes(&self.key_export))
            .field("last_updated", &self.last_updated)
            .finish()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Encrypted single-file session storage.
pub struct SessionStore {
    path: PathBuf,
    key: AeadKey,
    max_age_secs: u64,
}

impl SessionStore {
    /// Open the store described by `config`.
    ///
    /// The file key comes from `storage.session_key`, else the
    /// `CHATWIRE_SESSION_KEY` environment variable, else `<path>.key`
    /// (generated on first use).
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed configured key or if the key file
    /// cannot be written.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let key = match config.session_key_bytes().map_err(config_error)? {
            Some(key) => key,
            None => match std::env::var(SESSION_KEY_ENV) {
                Ok(hex_key) => decode_key(SESSION_KEY_ENV, &hex_key).map_err(config_error)?,
                Err(_) => load_or_create_key_file(&key_file_path(&config.session_path))?,
            },
        };
        Ok(Self::with_key(&config.session_path, key))
    }

    /// Store at `path` encrypted under `key`.
    #[must_use]
    pub fn with_key(path: impl AsRef<Path>, key: [u8; 32]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            key: AeadKey::new(key),
            max_age_secs: SESSION_MAX_AGE_SECS,
        }
    }

    /// Override the expiry age.
    #[must_use]
    pub fn with_max_age(mut self, max_age_secs: u64) -> Self {
        self.max_age_secs = max_age_secs;
        self
    }

    /// Session file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `record` is still within this store's maximum age.
    #[must_use]
    pub fn is_current(&self, record: &SessionRecord) -> bool {
        !record.is_expired(unix_now(), self.max_age_secs)
    }

    /// Load the record.
    ///
    /// Returns `None` if the file is missing, fails to decrypt or parse, or
    /// holds an expired record; an expired file is deleted.
    #[must_use]
    pub fn load(&self) -> Option<SessionRecord> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read session file {}: {}", self.path.display(), e);
                return None;
            }
        };

        let record = match self.open_sealed(&data) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Discarding unreadable session file: {}", e);
                return None;
            }
        };

        if !self.is_current(&record) {
            tracing::info!(
                client_id = %record.client_id,
                last_updated = record.last_updated,
                "Session expired, deleting"
            );
            if let Err(e) = self.clear() {
                tracing::warn!("Cannot delete expired session file: {}", e);
            }
            return None;
        }
        Some(record)
    }

    /// Encrypt and atomically write `record`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, encryption or the write fails.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let json = Zeroizing::new(serde_json::to_vec(record)?);
        let nonce = Nonce::generate(&mut OsRng);
        let ciphertext = self.key.encrypt(&nonce, &json, &[])?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(nonce.as_bytes());
        sealed.extend_from_slice(&ciphertext);
        write_private_file(&self.path, &sealed)?;

        tracing::debug!(client_id = %record.client_id, "Session saved");
        Ok(())
    }

    /// Delete the file. Succeeds if it is already absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open_sealed(&self, data: &[u8]) -> Result<SessionRecord> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ClientError::Serialization(Cow::Borrowed("session file truncated")));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce)
            .ok_or(ClientError::Serialization(Cow::Borrowed("bad nonce")))?;
        let json = Zeroizing::new(self.key.decrypt(&nonce, ciphertext, &[])?);
        Ok(serde_json::from_slice(&json)?)
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("max_age_secs", &self.max_age_secs)
            .finish_non_exhaustive()
    }
}

fn config_error(err: super::config::ConfigError) -> ClientError {
    ClientError::InvalidConfig(Cow::Owned(err.to_string()))
}

fn key_file_path(session_path: &Path) -> PathBuf {
    let mut name = session_path.as_os_str().to_os_string();
    name.push(".key");
    PathBuf::from(name)
}

fn load_or_create_key_file(path: &Path) -> Result<[u8; 32]> {
    match fs::read_to_string(path) {
        Ok(contents) => match decode_key("session key file", &contents) {
            Ok(key) => return Ok(key),
            Err(e) => tracing::warn!("Replacing malformed session key file: {}", e),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let key = chatwire_crypto::random::random_32()?;
    let encoded = Zeroizing::new(hex::encode(key));
    write_private_file(path, encoded.as_bytes())?;
    tracing::info!("Generated session key at {}", path.display());
    Ok(key)
}
