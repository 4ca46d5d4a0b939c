//! Long-term key material.
//!
//! The store owns the identity key pair, a batch of one-time prekeys and the
//! current signed prekey. Each category persists to its own JSON file in the
//! key directory and is rewritten after every mutation:
//!
//! ```text
//! <key_dir>/identity.json
//! <key_dir>/prekeys.json
//! <key_dir>/signed_prekey.json
//! ```
//!
//! With a passphrase configured each file instead holds an
//! [`EncryptedKeyFile`] wrapping the same JSON.
//!
//! Private halves never leave through the public accessors; the only way
//! out is [`KeyStore::export_all`].

use super::error::{ClientError, Result};
use super::{unix_now, write_private_file};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chatwire_crypto::encrypted_keys::{EncryptedKeyFile, KeyEncryptionParams};
use chatwire_crypto::signatures::{Signature, SigningKey, VerifyingKey};
use chatwire_crypto::x25519::{KeyPair, PrivateKey, PublicKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

const IDENTITY_FILE: &str = "identity.json";
const PREKEYS_FILE: &str = "prekeys.json";
const SIGNED_PREKEY_FILE: &str = "signed_prekey.json";

/// Long-term identity key pair.
#[derive(Clone, Debug)]
pub struct IdentityKeys {
    key_pair: KeyPair,
    created_at: u64,
}

impl IdentityKeys {
    /// Identity public key.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        *self.key_pair.public()
    }

    /// Ed25519 key that verifies this identity's signatures.
    ///
    /// # Errors
    ///
    /// Returns an error if key derivation fails.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(self.signing_key()?.verifying_key())
    }

    /// Creation time (unix seconds).
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    fn signing_key(&self) -> Result<SigningKey> {
        let mut secret = self.key_pair.private().to_bytes();
        let key = SigningKey::from_identity_secret(&secret);
        secret.zeroize();
        Ok(key?)
    }
}

/// One-time prekey.
#[derive(Clone, Debug)]
pub struct PreKey {
    id: u32,
    key_pair: KeyPair,
    created_at: u64,
}

impl PreKey {
    /// Prekey id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Prekey public key.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        *self.key_pair.public()
    }

    /// Creation time (unix seconds).
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub(crate) fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }
}

/// Medium-term prekey signed by the identity.
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    id: u32,
    key_pair: KeyPair,
    signature: Signature,
    created_at: u64,
}

impl SignedPreKey {
    /// Prekey id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Prekey public key.
    #[must_use]
    pub fn public(&self) -> PublicKey {
        *self.key_pair.public()
    }

    /// Identity signature over the public key.
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Creation time (unix seconds).
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Check the signature against an identity's verifying key.
    ///
    /// # Errors
    ///
    /// Returns [`chatwire_crypto::CryptoError::InvalidSignature`] on mismatch.
    pub fn verify(&self, identity: &VerifyingKey) -> std::result::Result<(), chatwire_crypto::CryptoError> {
        identity.verify(self.key_pair.public().as_bytes(), &self.signature)
    }
}

// On-disk forms. Keys are base64; the structs zeroize on drop.

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct StoredKey {
    id: u32,
    public: String,
    private: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    created_at: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredPreKeys {
    next_id: u32,
    prekeys: Vec<StoredKey>,
}

#[derive(Serialize, Deserialize, Default)]
struct KeyExport {
    identity: Option<StoredKey>,
    prekeys: StoredPreKeys,
    signed_prekey: Option<StoredKey>,
}

impl StoredKey {
    fn new(id: u32, key_pair: &KeyPair, signature: Option<&Signature>, created_at: u64) -> Self {
        let private = Zeroizing::new(key_pair.private().to_bytes());
        Self {
            id,
            public: B64.encode(key_pair.public().as_bytes()),
            private: B64.encode(private.as_slice()),
            signature: signature.map(|s| B64.encode(s.as_bytes())),
            created_at,
        }
    }

    fn key_pair(&self) -> Result<KeyPair> {
        let private = Zeroizing::new(
            B64.decode(&self.private)
                .map_err(|e| ClientError::Serialization(Cow::Owned(e.to_string())))?,
        );
        let bytes: [u8; 32] = private
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::Serialization(Cow::Borrowed("private key is not 32 bytes")))?;
        let key_pair = KeyPair::from_private(PrivateKey::from_bytes(bytes));

        let public = B64
            .decode(&self.public)
            .map_err(|e| ClientError::Serialization(Cow::Owned(e.to_string())))?;
        if public.as_slice() != key_pair.public().as_bytes() {
            return Err(ClientError::Serialization(Cow::Borrowed(
                "public key does not match private key",
            )));
        }
        Ok(key_pair)
    }

    fn signature(&self) -> Result<Option<Signature>> {
        self.signature
            .as_deref()
            .map(|s| {
                let bytes = B64
                    .decode(s)
                    .map_err(|e| ClientError::Serialization(Cow::Owned(e.to_string())))?;
                Ok(Signature::from_slice(&bytes)?)
            })
            .transpose()
    }
}

/// Identity, prekey and signed prekey storage.
pub struct KeyStore {
    dir: Option<PathBuf>,
    passphrase: Option<Zeroizing<String>>,
    params: KeyEncryptionParams,
    identity: Option<IdentityKeys>,
    prekeys: BTreeMap<u32, PreKey>,
    next_prekey_id: u32,
    signed_prekey: Option<SignedPreKey>,
}

impl KeyStore {
    /// Store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            passphrase: None,
            params: KeyEncryptionParams::default(),
            identity: None,
            prekeys: BTreeMap::new(),
            next_prekey_id: 1,
            signed_prekey: None,
        }
    }

    /// Open the store in `dir`, loading whatever keys are present.
    ///
    /// Missing or unreadable files are logged and treated as "no keys yet".
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>, passphrase: Option<&str>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut store = Self {
            dir: Some(dir),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
            ..Self::in_memory()
        };

        if let Some(stored) = store.read_file::<StoredKey>(IDENTITY_FILE) {
            match store.restore_identity(&stored) {
                Ok(identity) => store.identity = Some(identity),
                Err(e) => tracing::warn!("Ignoring unreadable identity key: {}", e),
            }
        }
        if let Some(stored) = store.read_file::<StoredPreKeys>(PREKEYS_FILE) {
            if let Err(e) = store.restore_prekeys(&stored) {
                tracing::warn!("Ignoring unreadable prekeys: {}", e);
            }
        }
        if let Some(stored) = store.read_file::<StoredKey>(SIGNED_PREKEY_FILE) {
            match Self::restore_signed(&stored) {
                Ok(signed) => store.signed_prekey = Some(signed),
                Err(e) => tracing::warn!("Ignoring unreadable signed prekey: {}", e),
            }
        }

        tracing::debug!(
            identity = store.identity.is_some(),
            prekeys = store.prekeys.len(),
            signed_prekey = store.signed_prekey.is_some(),
            "Key store opened"
        );
        Ok(store)
    }

    /// Argon2 cost used when writing encrypted key files.
    #[must_use]
    pub fn with_encryption_params(mut self, params: KeyEncryptionParams) -> Self {
        self.params = params;
        self
    }

    /// Generate a new identity, replacing the current one.
    ///
    /// The signed prekey is bound to the old identity and is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the keys cannot be persisted.
    pub fn generate_identity(&mut self) -> Result<IdentityKeys> {
        let identity = IdentityKeys {
            key_pair: KeyPair::generate(&mut OsRng),
            created_at: unix_now(),
        };
        self.identity = Some(identity.clone());
        self.persist_identity()?;

        if self.signed_prekey.take().is_some() {
            self.remove_file(SIGNED_PREKEY_FILE)?;
        }
        tracing::info!("Generated new identity key");
        Ok(identity)
    }

    /// Generate `count` one-time prekeys with consecutive ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the id space is exhausted or the keys cannot be
    /// persisted.
    pub fn generate_prekeys(&mut self, count: u32) -> Result<Vec<PreKey>> {
        let mut batch = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = self.next_prekey_id;
            self.next_prekey_id = id
                .checked_add(1)
                .ok_or(ClientError::invalid_state("prekey id space exhausted"))?;
            let prekey = PreKey {
                id,
                key_pair: KeyPair::generate(&mut OsRng),
                created_at: unix_now(),
            };
            self.prekeys.insert(id, prekey.clone());
            batch.push(prekey);
        }
        self.persist_prekeys()?;
        Ok(batch)
    }

    /// Generate a signed prekey, replacing the current one.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidState`] without an identity, or an error
    /// if the key cannot be persisted.
    pub fn generate_signed_prekey(&mut self) -> Result<SignedPreKey> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(ClientError::invalid_state("no identity key"))?;
        let key_pair = KeyPair::generate(&mut OsRng);
        let signature = identity.signing_key()?.sign(key_pair.public().as_bytes());
        let id = self.signed_prekey.as_ref().map_or(1, |s| s.id.wrapping_add(1));

        let signed = SignedPreKey {
            id,
            key_pair,
            signature,
            created_at: unix_now(),
        };
        self.signed_prekey = Some(signed.clone());
        self.persist_signed()?;
        Ok(signed)
    }

    /// Current identity.
    #[must_use]
    pub fn identity(&self) -> Option<&IdentityKeys> {
        self.identity.as_ref()
    }

    /// Current identity public key.
    #[must_use]
    pub fn identity_public(&self) -> Option<PublicKey> {
        self.identity.as_ref().map(IdentityKeys::public)
    }

    /// Prekey by id.
    #[must_use]
    pub fn prekey(&self, id: u32) -> Option<&PreKey> {
        self.prekeys.get(&id)
    }

    /// Unused prekeys in id order.
    pub fn prekeys(&self) -> impl Iterator<Item = &PreKey> {
        self.prekeys.values()
    }

    /// Number of unused prekeys.
    #[must_use]
    pub fn prekey_count(&self) -> usize {
        self.prekeys.len()
    }

    /// Current signed prekey.
    #[must_use]
    pub fn signed_prekey(&self) -> Option<&SignedPreKey> {
        self.signed_prekey.as_ref()
    }

    /// Remove a consumed prekey.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be persisted.
    pub fn remove_prekey(&mut self, id: u32) -> Result<Option<PreKey>> {
        let removed = self.prekeys.remove(&id);
        if removed.is_some() {
            self.persist_prekeys()?;
        }
        Ok(removed)
    }

    /// Serialize every key, private halves included.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export_all(&self) -> Result<Vec<u8>> {
        let export = KeyExport {
            identity: self.identity.as_ref().map(Self::stored_identity),
            prekeys: self.stored_prekeys(),
            signed_prekey: self.signed_prekey.as_ref().map(Self::stored_signed),
        };
        Ok(serde_json::to_vec(&export)?)
    }

    /// Replace every key with an export produced by [`export_all`](Self::export_all).
    ///
    /// Nothing changes if the export is malformed.
    ///
    /// # Errors
    ///
    /// Returns an error if the export is malformed or cannot be persisted.
    pub fn import_all(&mut self, data: &[u8]) -> Result<()> {
        let export: KeyExport = serde_json::from_slice(data)?;

        let identity = export
            .identity
            .as_ref()
            .map(|s| self.restore_identity(s))
            .transpose()?;
        let signed = export
            .signed_prekey
            .as_ref()
            .map(Self::restore_signed)
            .transpose()?;
        let mut staged = Self::in_memory();
        staged.restore_prekeys(&export.prekeys)?;

        self.identity = identity;
        self.signed_prekey = signed;
        self.prekeys = staged.prekeys;
        self.next_prekey_id = staged.next_prekey_id;

        match &self.identity {
            Some(_) => self.persist_identity()?,
            None => self.remove_file(IDENTITY_FILE)?,
        }
        self.persist_prekeys()?;
        match &self.signed_prekey {
            Some(_) => self.persist_signed()?,
            None => self.remove_file(SIGNED_PREKEY_FILE)?,
        }
        Ok(())
    }

    // ───────────────────────────── conversion ─────────────────────────────

    fn stored_identity(identity: &IdentityKeys) -> StoredKey {
        StoredKey::new(0, &identity.key_pair, None, identity.created_at)
    }

    fn stored_signed(signed: &SignedPreKey) -> StoredKey {
        StoredKey::new(signed.id, &signed.key_pair, Some(&signed.signature), signed.created_at)
    }

    fn stored_prekeys(&self) -> StoredPreKeys {
        StoredPreKeys {
            next_id: self.next_prekey_id,
            prekeys: self
                .prekeys
                .values()
                .map(|p| StoredKey::new(p.id, &p.key_pair, None, p.created_at))
                .collect(),
        }
    }

    fn restore_identity(&self, stored: &StoredKey) -> Result<IdentityKeys> {
        Ok(IdentityKeys {
            key_pair: stored.key_pair()?,
            created_at: stored.created_at,
        })
    }

    fn restore_signed(stored: &StoredKey) -> Result<SignedPreKey> {
        let signature = stored
            .signature()?
            .ok_or(ClientError::Serialization(Cow::Borrowed("signed prekey has no signature")))?;
        Ok(SignedPreKey {
            id: stored.id,
            key_pair: stored.key_pair()?,
            signature,
            created_at: stored.created_at,
        })
    }

    fn restore_prekeys(&mut self, stored: &StoredPreKeys) -> Result<()> {
        let mut prekeys = BTreeMap::new();
        for key in &stored.prekeys {
            prekeys.insert(
                key.id,
                PreKey {
                    id: key.id,
                    key_pair: key.key_pair()?,
                    created_at: key.created_at,
                },
            );
        }
        let highest = prekeys.keys().next_back().map_or(0, |id| id + 1);
        self.next_prekey_id = stored.next_id.max(highest).max(1);
        self.prekeys = prekeys;
        Ok(())
    }

    // ───────────────────────────── persistence ─────────────────────────────

    fn persist_identity(&self) -> Result<()> {
        match &self.identity {
            Some(identity) => self.write_file(IDENTITY_FILE, &Self::stored_identity(identity)),
            None => Ok(()),
        }
    }

    fn persist_prekeys(&self) -> Result<()> {
        self.write_file(PREKEYS_FILE, &self.stored_prekeys())
    }

    fn persist_signed(&self) -> Result<()> {
        match &self.signed_prekey {
            Some(signed) => self.write_file(SIGNED_PREKEY_FILE, &Self::stored_signed(signed)),
            None => Ok(()),
        }
    }

    fn write_file<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(value)?);
        let contents = match &self.passphrase {
            Some(passphrase) => {
                EncryptedKeyFile::encrypt(&json, passphrase.as_bytes(), self.params)?.to_bytes()
            }
            None => json.to_vec(),
        };
        write_private_file(&dir.join(name), &contents)?;
        Ok(())
    }

    fn read_file<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let path = self.dir.as_ref()?.join(name);
        let contents = match fs::read(&path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read {}: {}", path.display(), e);
                return None;
            }
        };

        let json = match &self.passphrase {
            Some(passphrase) => {
                match EncryptedKeyFile::from_bytes(&contents)
                    .and_then(|file| file.decrypt(passphrase.as_bytes()))
                {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Cannot decrypt {}: {}", path.display(), e);
                        return None;
                    }
                }
            }
            None => contents,
        };

        match serde_json::from_slice(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Cannot parse {}: {}", path.display(), e);
                None
            }
        }
    }

    fn remove_file(&self, name: &str) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        match fs::remove_file(dir.join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("encrypted", &self.passphrase.is_some())
            .field("identity", &self.identity_public())
            .field("prekeys", &self.prekeys.len())
            .field("signed_prekey", &self.signed_prekey.as_ref().map(|s| s.id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KeyEncryptionParams {
        KeyEncryptionParams::low_security()
    }

    #[test]
    fn test_generate_and_reload() {
        let dir = tempfile::tempdir().unwrap();

        let (identity, signed_id) = {
            let mut store = KeyStore::open(dir.path(), None).unwrap();
            let identity = store.generate_identity().unwrap().public();
            store.generate_prekeys(5).unwrap();
            let signed = store.generate_signed_prekey().unwrap();
            (identity, signed.id())
        };

        assert!(dir.path().join(IDENTITY_FILE).exists());
        assert!(dir.path().join(PREKEYS_FILE).exists());
        assert!(dir.path().join(SIGNED_PREKEY_FILE).exists());

        let store = KeyStore::open(dir.path(), None).unwrap();
        assert_eq!(store.identity_public(), Some(identity));
        assert_eq!(store.prekey_count(), 5);
        assert_eq!(store.signed_prekey().unwrap().id(), signed_id);
    }

    #[test]
    fn test_prekey_ids_monotonic() {
        let mut store = KeyStore::in_memory();
        let first: Vec<u32> = store.generate_prekeys(3).unwrap().iter().map(PreKey::id).collect();
        let second: Vec<u32> = store.generate_prekeys(2).unwrap().iter().map(PreKey::id).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![4, 5]);

        // Ids are not reused after removal
        store.remove_prekey(5).unwrap();
        assert_eq!(store.generate_prekeys(1).unwrap()[0].id(), 6);
    }

    #[test]
    fn test_remove_prekey() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::open(dir.path(), None).unwrap();
        store.generate_prekeys(3).unwrap();

        assert!(store.remove_prekey(2).unwrap().is_some());
        assert!(store.remove_prekey(2).unwrap().is_none());
        assert!(store.prekey(2).is_none());

        let reopened = KeyStore::open(dir.path(), None).unwrap();
        assert_eq!(reopened.prekey_count(), 2);
        assert!(reopened.prekey(1).is_some());
        assert!(reopened.prekey(3).is_some());
    }

    #[test]
    fn test_signed_prekey_verifies() {
        let mut store = KeyStore::in_memory();
        assert!(store.generate_signed_prekey().is_err());

        let identity = store.generate_identity().unwrap();
        let signed = store.generate_signed_prekey().unwrap();
        let verifying = identity.verifying_key().unwrap();
        assert!(signed.verify(&verifying).is_ok());

        let other = KeyStore::in_memory().generate_identity().unwrap();
        assert!(signed.verify(&other.verifying_key().unwrap()).is_err());
    }

    #[test]
    fn test_new_identity_discards_signed_prekey() {
        let mut store = KeyStore::in_memory();
        store.generate_identity().unwrap();
        store.generate_signed_prekey().unwrap();
        store.generate_identity().unwrap();
        assert!(store.signed_prekey().is_none());
    }

    #[test]
    fn test_export_import() {
        let mut source = KeyStore::in_memory();
        source.generate_identity().unwrap();
        source.generate_prekeys(4).unwrap();
        source.generate_signed_prekey().unwrap();
        let export = source.export_all().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut target = KeyStore::open(dir.path(), None).unwrap();
        target.import_all(&export).unwrap();
        assert_eq!(target.identity_public(), source.identity_public());
        assert_eq!(target.prekey_count(), 4);
        assert_eq!(
            target.signed_prekey().unwrap().public(),
            source.signed_prekey().unwrap().public()
        );
        assert_eq!(target.generate_prekeys(1).unwrap()[0].id(), 5);

        // Persisted, not just held in memory
        let reopened = KeyStore::open(dir.path(), None).unwrap();
        assert_eq!(reopened.identity_public(), source.identity_public());
    }

    #[test]
    fn test_import_malformed_leaves_state() {
        let mut store = KeyStore::in_memory();
        let identity = store.generate_identity().unwrap().public();
        assert!(store.import_all(b"not json").is_err());
        assert!(
            store
                .import_all(br#"{"identity":{"id":0,"public":"AA==","private":"AA==","created_at":0},"prekeys":{"next_id":1,"prekeys":[]},"signed_prekey":null}"#)
                .is_err()
        );
        assert_eq!(store.identity_public(), Some(identity));
    }

    #[test]
    fn test_export_contains_private_keys() {
        let mut store = KeyStore::in_memory();
        let identity = store.generate_identity().unwrap();
        let export = String::from_utf8(store.export_all().unwrap()).unwrap();
        let private = B64.encode(identity.key_pair().private().to_bytes());
        assert!(export.contains(&private));
        assert!(!format!("{identity:?}").contains(&private));
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDENTITY_FILE), b"{ broken").unwrap();
        let store = KeyStore::open(dir.path(), None).unwrap();
        assert!(store.identity().is_none());
    }

    #[test]
    fn test_encrypted_at_rest() {
        let dir = tempfile::tempdir().unwrap();
        let identity = {
            let mut store = KeyStore::open(dir.path(), Some("correct horse"))
                .unwrap()
                .with_encryption_params(fast_params());
            store.generate_identity().unwrap().public()
        };

        let raw = fs::read(dir.path().join(IDENTITY_FILE)).unwrap();
        assert!(serde_json::from_slice::<serde_json::Value>(&raw).is_err());

        let store = KeyStore::open(dir.path(), Some("correct horse")).unwrap();
        assert_eq!(store.identity_public(), Some(identity));

        // Wrong passphrase: treated as no keys
        let store = KeyStore::open(dir.path(), Some("wrong")).unwrap();
        assert!(store.identity().is_none());
    }

    #[test]
    fn test_plain_files_are_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = KeyStore::open(dir.path(), None).unwrap();
        store.generate_identity().unwrap();
        let raw = fs::read(dir.path().join(IDENTITY_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert!(value.get("public").is_some());
    }
}
