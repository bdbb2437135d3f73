use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::traits::{ObjectStore, StorageError};

/// In-process object store for tests and ephemeral deployments.
pub struct MemoryObjectStore {
    data: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Get current object count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw stored bytes, as written (sealed if the unit encrypts).
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.data.get(key).map(|r| r.value().clone())
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn driver(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.data
            .get(key)
            .map(|r| r.value().clone())
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}
