use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    encryption::{DEFAULT_KEY_CACHE_CAPACITY, EnvelopeEncryptor, KeyEncryptionKey},
    error::{Result, VaultError},
    io::RetryPolicy,
    keys::FileKeyVault,
    locks::DEFAULT_LOCK_SHARDS,
    store::DocumentStore,
};

const CONFIG_DIR_NAME: &str = ".docvault";
const KEYS_DIR: &str = "keys";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Base64 256-bit key that wraps every per-project data key.
    pub key_encryption_key: Option<String>,
    #[serde(default = "default_key_encryption_key_id")]
    pub key_encryption_key_id: String,
    #[serde(default = "default_key_cache_capacity")]
    pub key_cache_capacity: usize,
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
    #[serde(default)]
    pub io_retry: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            key_encryption_key: Some(KeyEncryptionKey::generate_base64()),
            key_encryption_key_id: default_key_encryption_key_id(),
            key_cache_capacity: default_key_cache_capacity(),
            lock_shards: default_lock_shards(),
            io_retry: RetryPolicy::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub data_dir: Option<PathBuf>,
    pub key_cache_capacity: Option<usize>,
    pub lock_shards: Option<usize>,
    pub io_retry_attempts: Option<u32>,
    pub io_retry_backoff_ms: Option<u64>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.data_dir.is_none()
            && self.key_cache_capacity.is_none()
            && self.lock_shards.is_none()
            && self.io_retry_attempts.is_none()
            && self.io_retry_backoff_ms.is_none()
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

/// Reads the config at `path` (or the default location), creating it with a
/// fresh key-encryption key on first use. A new config keeps its data next to
/// the config file.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let mut cfg: Config = toml::from_str(&contents)?;
        let updated = cfg.ensure_key_encryption_key();
        cfg.ensure_data_dir()?;
        if updated {
            cfg.save(&config_path)?;
        }
        Ok((cfg, config_path))
    } else {
        let mut cfg = Config::default();
        if let Some(parent) = config_path.parent() {
            cfg.data_dir = parent.to_path_buf();
        }
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(capacity) = update.key_cache_capacity {
            self.key_cache_capacity = capacity.max(1);
        }
        if let Some(shards) = update.lock_shards {
            self.lock_shards = shards.max(1);
        }
        if let Some(attempts) = update.io_retry_attempts {
            self.io_retry.attempts = attempts.max(1);
        }
        if let Some(backoff_ms) = update.io_retry_backoff_ms {
            self.io_retry.backoff_ms = backoff_ms;
        }
        self.updated_at = Utc::now();
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn ensure_key_encryption_key(&mut self) -> bool {
        let missing = self
            .key_encryption_key
            .as_deref()
            .map(|value| value.trim().is_empty())
            .unwrap_or(true);
        if !missing {
            return false;
        }
        self.key_encryption_key = Some(KeyEncryptionKey::generate_base64());
        self.updated_at = Utc::now();
        true
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(KEYS_DIR)
    }

    pub fn key_encryption_key(&self) -> Result<KeyEncryptionKey> {
        let encoded = self
            .key_encryption_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| VaultError::Config("key_encryption_key is not set".into()))?;
        KeyEncryptionKey::new_from_base64(&self.key_encryption_key_id, encoded)
    }

    pub fn encryption_service(&self) -> Result<Arc<EnvelopeEncryptor>> {
        let vault = Arc::new(FileKeyVault::new(self.keys_path()));
        Ok(Arc::new(EnvelopeEncryptor::new(
            self.key_encryption_key()?,
            vault,
            self.key_cache_capacity,
        )))
    }

    pub fn open_store(&self) -> Result<DocumentStore> {
        Ok(DocumentStore::new(&self.data_dir, self.encryption_service()?)
            .with_lock_shards(self.lock_shards)
            .with_retry(self.io_retry))
    }
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(CONFIG_DIR_NAME))
    } else {
        env::current_dir()
            .map(|dir| dir.join(CONFIG_DIR_NAME))
            .map_err(|err| VaultError::Config(err.to_string()))
    }
}

fn default_data_dir() -> PathBuf {
    default_config_root().unwrap_or_else(|_| PathBuf::from(CONFIG_DIR_NAME))
}

fn default_key_encryption_key_id() -> String {
    "kek-1".to_string()
}

fn default_key_cache_capacity() -> usize {
    DEFAULT_KEY_CACHE_CAPACITY
}

fn default_lock_shards() -> usize {
    DEFAULT_LOCK_SHARDS
}
