//! Secure key/value storage abstraction
//!
//! Holds the local keypair, RTC config and user profile. Encryption and the
//! backing medium belong to the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Storage key of the local secret key
pub const IDENTITY_KEY: &str = "identity";
/// Storage key of the user profile
pub const PROFILE_KEY: &str = "profile";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt value for key '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn retrieve(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// In-memory storage
#[derive(Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// Locally persisted user profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Profile {
    pub async fn load(storage: &dyn SecureStorage) -> Result<Self, StorageError> {
        match storage.retrieve(PROFILE_KEY).await? {
            Some(json) => serde_json::from_str(&json).map_err(|e| StorageError::Corrupt {
                key: PROFILE_KEY.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(Self::default()),
        }
    }

    pub async fn save(&self, storage: &dyn SecureStorage) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(self).map_err(|e| StorageError::Backend(e.to_string()))?;
        storage.store(PROFILE_KEY, &json).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.retrieve("a").await.unwrap(), None);

        storage.store("a", "1").await.unwrap();
        assert_eq!(storage.retrieve("a").await.unwrap(), Some("1".to_string()));

        storage.delete("a").await.unwrap();
        assert_eq!(storage.retrieve("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let storage = MemoryStorage::new();
        assert_eq!(Profile::load(&storage).await.unwrap(), Profile::default());

        let profile = Profile {
            nickname: Some("ada".to_string()),
        };
        profile.save(&storage).await.unwrap();
        assert_eq!(Profile::load(&storage).await.unwrap(), profile);
    }

    #[tokio::test]
    async fn test_corrupt_profile() {
        let storage = MemoryStorage::new();
        storage.store(PROFILE_KEY, "{not json").await.unwrap();
        assert!(matches!(
            Profile::load(&storage).await,
            Err(StorageError::Corrupt { .. })
        ));
    }
}
