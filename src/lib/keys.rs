use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    error::{Result, VaultError},
    validation::ensure_aggregate_id,
};

/// A data-encryption key as it is allowed to exist outside process memory:
/// wrapped under a key-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKey {
    pub key_id: String,
    pub version: u32,
    #[serde(with = "base64_bytes")]
    pub wrapped_key_material: Vec<u8>,
    pub wrapped_by_key_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Persistence for wrapped keys.
pub trait KeyVault: Send + Sync {
    fn load(&self, key_id: &str) -> Result<Option<WrappedKey>>;

    /// Stores `key` only when no record exists for its id. Returns `false`
    /// without touching the existing record otherwise.
    fn create(&self, key: &WrappedKey) -> Result<bool>;

    /// Stores `key`, replacing any existing record.
    fn replace(&self, key: &WrappedKey) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryKeyVault {
    keys: Mutex<HashMap<String, WrappedKey>>,
}

impl InMemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for InMemoryKeyVault {
    fn load(&self, key_id: &str) -> Result<Option<WrappedKey>> {
        Ok(self.keys.lock().get(key_id).cloned())
    }

    fn create(&self, key: &WrappedKey) -> Result<bool> {
        let mut guard = self.keys.lock();
        if guard.contains_key(&key.key_id) {
            return Ok(false);
        }
        guard.insert(key.key_id.clone(), key.clone());
        Ok(true)
    }

    fn replace(&self, key: &WrappedKey) -> Result<()> {
        self.keys.lock().insert(key.key_id.clone(), key.clone());
        Ok(())
    }
}

/// Stores one JSON record per key under `root/{keyId}.key.json`.
#[derive(Debug, Clone)]
pub struct FileKeyVault {
    root: PathBuf,
}

impl FileKeyVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key_id: &str) -> Result<PathBuf> {
        ensure_aggregate_id(key_id)?;
        Ok(self.root.join(format!("{key_id}.key.json")))
    }

    fn staged(&self, key: &WrappedKey) -> Result<NamedTempFile> {
        fs::create_dir_all(&self.root)?;
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&serde_json::to_vec_pretty(key)?)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

impl KeyVault for FileKeyVault {
    fn load(&self, key_id: &str) -> Result<Option<WrappedKey>> {
        let path = self.path_for(key_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn create(&self, key: &WrappedKey) -> Result<bool> {
        let path = self.path_for(&key.key_id)?;
        let tmp = self.staged(key)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(VaultError::Io(err.error)),
        }
    }

    fn replace(&self, key: &WrappedKey) -> Result<()> {
        let path = self.path_for(&key.key_id)?;
        let tmp = self.staged(key)?;
        tmp.persist(&path).map_err(|err| VaultError::Io(err.error))?;
        Ok(())
    }
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.trim()).map_err(D::Error::custom)
    }
}
