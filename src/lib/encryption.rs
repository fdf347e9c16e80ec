use std::{fmt, num::NonZeroUsize, sync::Arc};

use aes_gcm::{
    Aes256Gcm, Key, KeyInit, Nonce, Tag,
    aead::{Aead, AeadInPlace, Payload},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use lru::LruCache;
use metrics::counter;
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{
    envelope::{EncryptedEnvelope, NONCE_LEN, TAG_LEN},
    error::{Result, VaultError},
    keys::{KeyVault, WrappedKey},
    validation::ensure_aggregate_id,
};

pub const KEY_LEN: usize = 32;
pub const DEFAULT_KEY_CACHE_CAPACITY: usize = 1024;

const WRAPPED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;
const BINDING_SEP: u8 = 0x1F;

/// The key-encryption key. Raw data keys are only ever persisted after being
/// wrapped by it.
#[derive(Clone)]
pub struct KeyEncryptionKey {
    id: String,
    cipher: Aes256Gcm,
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyEncryptionKey({})", self.id)
    }
}

impl KeyEncryptionKey {
    pub fn new_from_base64(id: impl Into<String>, key_b64: &str) -> Result<Self> {
        let trimmed = key_b64.trim();
        if trimmed.is_empty() {
            return Err(VaultError::Config(
                "key encryption key cannot be empty".to_string(),
            ));
        }
        let bytes = Zeroizing::new(
            STANDARD
                .decode(trimmed)
                .map_err(|err| VaultError::Config(format!("invalid key encryption key: {err}")))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(VaultError::Config(
                "key encryption key must decode to 32 bytes (256 bits)".to_string(),
            ));
        }
        #[allow(deprecated)]
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            id: id.into(),
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn generate_base64() -> String {
        let bytes = random_key();
        STANDARD.encode(bytes.as_slice())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn wrap(&self, key_id: &str, version: u32, material: &[u8; KEY_LEN]) -> Result<Vec<u8>> {
        let nonce_bytes = random_nonce();
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = binding(key_id, version);
        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: material,
                    aad: &aad,
                },
            )
            .map_err(|err| VaultError::Storage(format!("key wrapping failure: {err}")))?;

        let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        if wrapped.wrapped_by_key_id != self.id {
            return Err(VaultError::Config(format!(
                "data key for {} is wrapped by '{}' but the configured key encryption key is '{}'",
                wrapped.key_id, wrapped.wrapped_by_key_id, self.id
            )));
        }
        if wrapped.wrapped_key_material.len() != WRAPPED_KEY_LEN {
            return Err(VaultError::authentication(&wrapped.key_id));
        }
        let (nonce_bytes, sealed) = wrapped.wrapped_key_material.split_at(NONCE_LEN);
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(nonce_bytes);
        let aad = binding(&wrapped.key_id, wrapped.version);
        let opened = Zeroizing::new(
            self.cipher
                .decrypt(nonce, Payload { msg: sealed, aad: &aad })
                .map_err(|_| VaultError::authentication(&wrapped.key_id))?,
        );
        let mut material = Zeroizing::new([0u8; KEY_LEN]);
        material.copy_from_slice(&opened);
        Ok(material)
    }
}

struct DataKey {
    version: u32,
    cipher: Aes256Gcm,
}

impl DataKey {
    fn from_material(version: u32, material: &[u8; KEY_LEN]) -> Self {
        #[allow(deprecated)]
        let key = Key::<Aes256Gcm>::from_slice(material);
        Self {
            version,
            cipher: Aes256Gcm::new(key),
        }
    }
}

/// Per-aggregate envelope encryption: one data key per aggregate id, each
/// wrapped by the configured key-encryption key.
pub struct EnvelopeEncryptor {
    kek: KeyEncryptionKey,
    vault: Arc<dyn KeyVault>,
    cache: Mutex<LruCache<String, Arc<DataKey>>>,
    provisioning: Mutex<()>,
}

impl fmt::Debug for EnvelopeEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeEncryptor(..)")
    }
}

impl EnvelopeEncryptor {
    pub fn new(kek: KeyEncryptionKey, vault: Arc<dyn KeyVault>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity)
            .or(NonZeroUsize::new(DEFAULT_KEY_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            kek,
            vault,
            cache: Mutex::new(LruCache::new(capacity)),
            provisioning: Mutex::new(()),
        }
    }

    pub fn key_encryption_key_id(&self) -> &str {
        self.kek.id()
    }

    /// Encrypts under the aggregate's data key, creating that key on first use.
    pub fn encrypt(&self, plaintext: &[u8], aggregate_id: &str) -> Result<EncryptedEnvelope> {
        ensure_aggregate_id(aggregate_id)?;
        let key = self.data_key(aggregate_id, true)?.ok_or_else(|| {
            VaultError::Storage(format!("data key for {aggregate_id} was not provisioned"))
        })?;

        let nonce_bytes = random_nonce();
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&nonce_bytes);
        let aad = binding(aggregate_id, key.version);
        let mut buffer = plaintext.to_vec();
        let tag = key
            .cipher
            .encrypt_in_place_detached(nonce, &aad, &mut buffer)
            .map_err(|err| {
                record_crypto_op("encrypt", "err");
                VaultError::Storage(format!("encryption failure: {err}"))
            })?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_slice());
        record_crypto_op("encrypt", "ok");
        Ok(EncryptedEnvelope {
            ciphertext: buffer,
            nonce: nonce_bytes,
            tag: tag_bytes,
            key_id: aggregate_id.to_string(),
            key_version: key.version,
        })
    }

    /// Fails closed: any mismatch between the envelope, the requested
    /// aggregate and the live data key is an authentication failure.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope, aggregate_id: &str) -> Result<Vec<u8>> {
        ensure_aggregate_id(aggregate_id)?;
        let result = self.open(envelope, aggregate_id);
        record_crypto_op("decrypt", if result.is_ok() { "ok" } else { "err" });
        result
    }

    fn open(&self, envelope: &EncryptedEnvelope, aggregate_id: &str) -> Result<Vec<u8>> {
        if envelope.key_id != aggregate_id {
            return Err(VaultError::authentication(aggregate_id));
        }
        let key = self
            .data_key(aggregate_id, false)?
            .ok_or_else(|| VaultError::authentication(aggregate_id))?;
        if key.version != envelope.key_version {
            debug!(
                aggregate_id,
                envelope_version = envelope.key_version,
                live_version = key.version,
                "envelope was sealed under a retired data key"
            );
            return Err(VaultError::authentication(aggregate_id));
        }

        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&envelope.nonce);
        #[allow(deprecated)]
        let tag = Tag::from_slice(&envelope.tag);
        let aad = binding(aggregate_id, envelope.key_version);
        let mut buffer = envelope.ciphertext.clone();
        key.cipher
            .decrypt_in_place_detached(nonce, &aad, &mut buffer, tag)
            .map_err(|_| VaultError::authentication(aggregate_id))?;
        Ok(buffer)
    }

    /// Provisions version 1 of a data key. An existing key is never replaced
    /// here; use [`EnvelopeEncryptor::rotate_key`] for that.
    pub fn generate_key(&self, aggregate_id: &str, owner_id: &str) -> Result<WrappedKey> {
        ensure_aggregate_id(aggregate_id)?;
        let _guard = self.provisioning.lock();
        let material = random_key();
        let wrapped = self.wrap_record(aggregate_id, 1, &material, Some(owner_id.to_string()))?;
        if !self.vault.create(&wrapped)? {
            return Err(VaultError::KeyExists(aggregate_id.to_string()));
        }
        self.cache.lock().put(
            aggregate_id.to_string(),
            Arc::new(DataKey::from_material(1, &material)),
        );
        info!(aggregate_id, owner_id, "generated data key");
        Ok(wrapped)
    }

    /// Replaces the data key in place. Everything sealed under the previous
    /// key becomes permanently undecryptable.
    pub fn rotate_key(&self, aggregate_id: &str) -> Result<WrappedKey> {
        ensure_aggregate_id(aggregate_id)?;
        let _guard = self.provisioning.lock();
        let current = self.vault.load(aggregate_id)?;
        let version = current.as_ref().map(|key| key.version + 1).unwrap_or(1);
        let owner_id = current.and_then(|key| key.owner_id);

        let material = random_key();
        let wrapped = self.wrap_record(aggregate_id, version, &material, owner_id)?;
        self.vault.replace(&wrapped)?;
        self.cache.lock().put(
            aggregate_id.to_string(),
            Arc::new(DataKey::from_material(version, &material)),
        );
        warn!(
            aggregate_id,
            version, "rotated data key; earlier ciphertexts are no longer decryptable"
        );
        Ok(wrapped)
    }

    pub fn key_record(&self, aggregate_id: &str) -> Result<Option<WrappedKey>> {
        ensure_aggregate_id(aggregate_id)?;
        self.vault.load(aggregate_id)
    }

    fn data_key(&self, aggregate_id: &str, create: bool) -> Result<Option<Arc<DataKey>>> {
        if let Some(key) = self.cache.lock().get(aggregate_id).cloned() {
            return Ok(Some(key));
        }

        let _guard = self.provisioning.lock();
        if let Some(key) = self.cache.lock().get(aggregate_id).cloned() {
            return Ok(Some(key));
        }

        let key = match self.vault.load(aggregate_id)? {
            Some(wrapped) => self.unwrap_record(&wrapped)?,
            None if create => {
                let material = random_key();
                let wrapped = self.wrap_record(aggregate_id, 1, &material, None)?;
                if self.vault.create(&wrapped)? {
                    debug!(aggregate_id, "provisioned data key on first use");
                    DataKey::from_material(1, &material)
                } else {
                    // Another process provisioned the key between our load and create.
                    let existing = self.vault.load(aggregate_id)?.ok_or_else(|| {
                        VaultError::Storage(format!("data key for {aggregate_id} vanished"))
                    })?;
                    self.unwrap_record(&existing)?
                }
            }
            None => return Ok(None),
        };

        let key = Arc::new(key);
        self.cache
            .lock()
            .put(aggregate_id.to_string(), Arc::clone(&key));
        Ok(Some(key))
    }

    fn wrap_record(
        &self,
        aggregate_id: &str,
        version: u32,
        material: &[u8; KEY_LEN],
        owner_id: Option<String>,
    ) -> Result<WrappedKey> {
        Ok(WrappedKey {
            key_id: aggregate_id.to_string(),
            version,
            wrapped_key_material: self.kek.wrap(aggregate_id, version, material)?,
            wrapped_by_key_id: self.kek.id().to_string(),
            created_at: Utc::now(),
            owner_id,
        })
    }

    fn unwrap_record(&self, wrapped: &WrappedKey) -> Result<DataKey> {
        let material = self.kek.unwrap(wrapped)?;
        Ok(DataKey::from_material(wrapped.version, &material))
    }
}

fn binding(key_id: &str, version: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + 11);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(BINDING_SEP);
    aad.extend_from_slice(version.to_string().as_bytes());
    aad
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut material = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(material.as_mut_slice());
    material
}

fn record_crypto_op(operation: &'static str, status: &'static str) {
    let labels = [("operation", operation), ("status", status)];
    counter!("docvault_crypto_operations_total", &labels).increment(1);
}
