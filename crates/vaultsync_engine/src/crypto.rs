//! Per-vault payload encryption using AES-256-GCM.
//!
//! Encryption sits at the gateway boundary: inbound payloads are opened
//! right after fetch, outbound payloads are sealed right before send. The
//! protected fields are serialized, sealed, and carried inside the JSON
//! record as base64 under `encryptedData`; everything else (ids,
//! timestamps, vault membership) stays in the clear so the server can
//! index it.
//!
//! Entity types that opt out of encryption get the [`PassthroughCipher`],
//! selected when the service registry is built.

use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use rand::RngCore;
use serde_json::{Map, Value};
use std::collections::HashMap;
use vaultsync_protocol::{Change, EntityRecord};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Record fields sealed by the cipher.
const PROTECTED_FIELDS: &[&str] = &["content"];
/// Field carrying the sealed payload.
const SEALED_FIELD: &str = "encryptedData";

/// A vault's symmetric encryption key.
///
/// The key is zeroized when dropped.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SyncError::Crypto(format!(
                "invalid key size {}, expected {KEY_SIZE}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a vault key from the vault's master secret using
    /// HKDF-SHA256. The vault id is the salt, so two vaults sharing a
    /// master secret still get distinct keys.
    pub fn derive(master_secret: &[u8], vault_id: &str) -> SyncResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(vault_id.as_bytes()), master_secret);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(b"vaultsync-payload-key-v1", &mut bytes)
            .map_err(|_| SyncError::Crypto("HKDF expand failed".into()))?;
        Ok(Self { bytes })
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Transparent encryption/decryption of change payloads per vault.
#[async_trait]
pub trait PayloadCipher: Send + Sync {
    /// Seals a record's protected fields for transmission.
    async fn encrypt_record(&self, vault_id: &str, record: EntityRecord)
        -> SyncResult<EntityRecord>;

    /// Opens a record's sealed payload after receipt.
    async fn decrypt_record(&self, vault_id: &str, record: EntityRecord)
        -> SyncResult<EntityRecord>;

    /// Seals a batch of changes. Create objects and update modifications
    /// are sealed; deletes pass through untouched.
    async fn encrypt_changes(&self, vault_id: &str, changes: Vec<Change>)
        -> SyncResult<Vec<Change>> {
        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            out.push(match change {
                Change::Create {
                    table,
                    key,
                    object,
                    origin,
                } => Change::Create {
                    table,
                    key,
                    object: self.encrypt_record(vault_id, object).await?,
                    origin,
                },
                Change::Update {
                    table,
                    key,
                    mods,
                    origin,
                } => Change::Update {
                    table,
                    key,
                    mods: self
                        .encrypt_record(vault_id, EntityRecord::from_map(mods))
                        .await?
                        .into_map(),
                    origin,
                },
                delete => delete,
            });
        }
        Ok(out)
    }

    /// Opens a batch of changes.
    async fn decrypt_changes(&self, vault_id: &str, changes: Vec<Change>)
        -> SyncResult<Vec<Change>> {
        let mut out = Vec::with_capacity(changes.len());
        for change in changes {
            out.push(match change {
                Change::Create {
                    table,
                    key,
                    object,
                    origin,
                } => Change::Create {
                    table,
                    key,
                    object: self.decrypt_record(vault_id, object).await?,
                    origin,
                },
                Change::Update {
                    table,
                    key,
                    mods,
                    origin,
                } => Change::Update {
                    table,
                    key,
                    mods: self
                        .decrypt_record(vault_id, EntityRecord::from_map(mods))
                        .await?
                        .into_map(),
                    origin,
                },
                delete => delete,
            });
        }
        Ok(out)
    }
}

/// AES-256-GCM cipher with a per-vault key cache.
#[derive(Debug, Default)]
pub struct VaultCipher {
    keys: RwLock<HashMap<String, VaultKey>>,
}

impl VaultCipher {
    /// Creates a cipher with an empty key cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a vault's key.
    pub fn register_key(&self, vault_id: impl Into<String>, key: VaultKey) {
        self.keys.write().insert(vault_id.into(), key);
    }

    /// Registers a key derived from the vault's master secret.
    pub fn register_master_secret(&self, vault_id: &str, master_secret: &[u8]) -> SyncResult<()> {
        let key = VaultKey::derive(master_secret, vault_id)?;
        self.register_key(vault_id, key);
        Ok(())
    }

    /// Drops a vault's key from the cache.
    pub fn forget_key(&self, vault_id: &str) {
        self.keys.write().remove(vault_id);
    }

    /// Returns true if a key is cached for the vault.
    pub fn has_key(&self, vault_id: &str) -> bool {
        self.keys.read().contains_key(vault_id)
    }

    fn key_for(&self, vault_id: &str) -> SyncResult<VaultKey> {
        self.keys
            .read()
            .get(vault_id)
            .cloned()
            .ok_or_else(|| SyncError::Crypto(format!("no key registered for vault {vault_id}")))
    }

    fn seal(&self, vault_id: &str, plaintext: &[u8]) -> SyncResult<String> {
        let key = self.key_for(vault_id)?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = key
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| SyncError::Crypto("encryption error".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend(ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn open(&self, vault_id: &str, sealed: &str) -> SyncResult<Vec<u8>> {
        let key = self.key_for(vault_id)?;
        let sealed = BASE64
            .decode(sealed)
            .map_err(|_| SyncError::Crypto("invalid base64 payload".into()))?;
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SyncError::Crypto("ciphertext too short".into()));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        key.cipher()
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| SyncError::Crypto("decryption error".into()))
    }
}

#[async_trait]
impl PayloadCipher for VaultCipher {
    async fn encrypt_record(
        &self,
        vault_id: &str,
        mut record: EntityRecord,
    ) -> SyncResult<EntityRecord> {
        let mut protected = Map::new();
        for field in PROTECTED_FIELDS {
            if let Some(value) = record.remove(field) {
                protected.insert((*field).to_string(), value);
            }
        }
        if protected.is_empty() {
            return Ok(record);
        }

        let plaintext = serde_json::to_vec(&Value::Object(protected))
            .map_err(|e| SyncError::Crypto(e.to_string()))?;
        let sealed = self.seal(vault_id, &plaintext)?;
        record.set(SEALED_FIELD, Value::from(sealed));
        Ok(record)
    }

    async fn decrypt_record(
        &self,
        vault_id: &str,
        mut record: EntityRecord,
    ) -> SyncResult<EntityRecord> {
        let Some(sealed) = record.remove(SEALED_FIELD) else {
            return Ok(record);
        };
        let sealed = sealed
            .as_str()
            .ok_or_else(|| SyncError::Crypto("sealed payload is not a string".into()))?
            .to_string();

        let plaintext = self.open(vault_id, &sealed)?;
        let protected: Map<String, Value> =
            serde_json::from_slice(&plaintext).map_err(|e| SyncError::Crypto(e.to_string()))?;
        for (field, value) in protected {
            record.set(field, value);
        }
        Ok(record)
    }
}

/// No-op cipher for entity types that opt out of encryption.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

#[async_trait]
impl PayloadCipher for PassthroughCipher {
    async fn encrypt_record(
        &self,
        _vault_id: &str,
        record: EntityRecord,
    ) -> SyncResult<EntityRecord> {
        Ok(record)
    }

    async fn decrypt_record(
        &self,
        _vault_id: &str,
        record: EntityRecord,
    ) -> SyncResult<EntityRecord> {
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> EntityRecord {
        serde_json::from_value(value).unwrap()
    }

    fn cipher_with_key(vault_id: &str) -> VaultCipher {
        let cipher = VaultCipher::new();
        cipher.register_key(vault_id, VaultKey::generate());
        cipher
    }

    #[tokio::test]
    async fn record_roundtrip() {
        let cipher = cipher_with_key("v1");
        let original = record(json!({"id": "a", "content": "secret body", "updatedAt": 5}));

        let sealed = cipher.encrypt_record("v1", original.clone()).await.unwrap();
        assert_eq!(sealed.content(), None);
        assert!(sealed.get(SEALED_FIELD).is_some());
        // cleartext metadata survives
        assert_eq!(sealed.id(), Some("a"));
        assert_eq!(sealed.updated_at(), Some(5));

        let opened = cipher.decrypt_record("v1", sealed).await.unwrap();
        assert_eq!(opened, original);
    }

    #[tokio::test]
    async fn record_without_protected_fields_is_untouched() {
        let cipher = cipher_with_key("v1");
        let original = record(json!({"id": "a", "updatedAt": 5}));

        let sealed = cipher.encrypt_record("v1", original.clone()).await.unwrap();
        assert_eq!(sealed, original);
    }

    #[tokio::test]
    async fn missing_key_is_an_error() {
        let cipher = VaultCipher::new();
        let result = cipher
            .encrypt_record("unknown", record(json!({"id": "a", "content": "x"})))
            .await;
        assert!(matches!(result, Err(SyncError::Crypto(_))));
    }

    #[tokio::test]
    async fn wrong_vault_key_fails_to_open() {
        let cipher = VaultCipher::new();
        cipher.register_key("v1", VaultKey::generate());
        cipher.register_key("v2", VaultKey::generate());

        let sealed = cipher
            .encrypt_record("v1", record(json!({"id": "a", "content": "x"})))
            .await
            .unwrap();
        let result = cipher.decrypt_record("v2", sealed).await;
        assert!(matches!(result, Err(SyncError::Crypto(_))));
    }

    #[tokio::test]
    async fn derived_keys_are_deterministic_per_vault() {
        let k1 = VaultKey::derive(b"master", "v1").unwrap();
        let k2 = VaultKey::derive(b"master", "v1").unwrap();
        let k3 = VaultKey::derive(b"master", "v2").unwrap();

        assert_eq!(k1.bytes, k2.bytes);
        assert_ne!(k1.bytes, k3.bytes);
    }

    #[tokio::test]
    async fn changes_seal_creates_and_updates_only() {
        let cipher = cipher_with_key("v1");
        let changes = vec![
            vaultsync_protocol::Change::create(
                "documents",
                record(json!({"id": "a", "content": "body"})),
                vaultsync_protocol::ChangeOrigin::Device,
            ),
            vaultsync_protocol::Change::delete(
                "documents",
                "b",
                vaultsync_protocol::ChangeOrigin::Device,
            ),
        ];

        let sealed = cipher.encrypt_changes("v1", changes).await.unwrap();
        assert!(sealed[0].object().unwrap().get(SEALED_FIELD).is_some());
        assert_eq!(sealed[1].kind(), vaultsync_protocol::ChangeKind::Delete);

        let opened = cipher.decrypt_changes("v1", sealed).await.unwrap();
        assert_eq!(opened[0].object().unwrap().content(), Some("body"));
    }

    #[tokio::test]
    async fn passthrough_is_identity() {
        let cipher = PassthroughCipher;
        let original = record(json!({"id": "a", "content": "plain"}));
        let out = cipher.encrypt_record("v1", original.clone()).await.unwrap();
        assert_eq!(out, original);
    }

    #[test]
    fn key_size_is_checked() {
        assert!(VaultKey::from_bytes(&[0u8; 16]).is_err());
        assert!(VaultKey::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn key_cache_management() {
        let cipher = VaultCipher::new();
        assert!(!cipher.has_key("v1"));
        cipher.register_master_secret("v1", b"secret").unwrap();
        assert!(cipher.has_key("v1"));
        cipher.forget_key("v1");
        assert!(!cipher.has_key("v1"));
    }
}
