//! Durable Storage Module
//!
//! Key/value persistence for the session's serialized form. Only the
//! session manager reads or writes through this interface.

use std::path::PathBuf;
use tracing::{debug, error, info};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),
}

/// Durable string storage keyed by name.
///
/// Mirrors the web platform contract the backend was designed against:
/// `get` returns the stored value or nothing, `set` overwrites, `remove`
/// is a no-op for missing keys.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// File-backed storage, one file per key under the platform data dir.
pub struct FileStorage {
    storage_path: PathBuf,
}

impl FileStorage {
    /// Create storage rooted at the platform-local data directory.
    pub fn new() -> Self {
        let storage_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("EcoRoute");
        Self::with_dir(storage_path)
    }

    /// Create storage rooted at an explicit directory.
    pub fn with_dir(storage_path: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }
        debug!("Durable storage initialized at: {:?}", storage_path);
        Self { storage_path }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.key_path(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        std::fs::write(self.key_path(key), value).map_err(|e| StorageError::Io(e.to_string()))?;
        info!("Saved value for key: {}", key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored value for key: {}", key);
        }
        Ok(())
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new()
    }
}
