// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Buffer and storage units.
//!
//! ```text
//!  ingest ──► KvBuffer (one per deployment)
//!                 │ sync
//!                 ▼
//!  DriverUnit ── Addressing (identity | convergent) ── ObjectStore
//!                                                      ├─ LocalStore  (local, nfs)
//!                                                      ├─ S3Store
//!                                                      ├─ WebdavStore
//!                                                      ├─ UpstreamStore (read-only)
//!                                                      └─ MemoryObjectStore
//! ```

pub mod buffer;
pub mod local;
pub mod memory;
pub mod s3;
pub mod traits;
pub mod units;
pub mod upstream;
pub mod webdav;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

use crate::config::{DriverConfig, StorageConfig};
use crate::convergent::Addressing;
use crate::item::{ContentDigest, Item, ItemUnit, UnitRecord};
use traits::{ObjectStore, StorageError, StorageUnit, Unit};

pub use buffer::{KvBuffer, Position};
pub use local::LocalStore;
pub use memory::MemoryObjectStore;
pub use s3::S3Store;
pub use units::{RunningStorage, RunningUnits, Source};
pub use upstream::UpstreamStore;
pub use webdav::WebdavStore;

/// Instantiate the object store for a driver table.
///
/// Every driver validates connectivity before returning, so a misconfigured
/// unit fails startup instead of the first sync.
pub async fn build_object_store(driver: &DriverConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    let store: Arc<dyn ObjectStore> = match driver {
        DriverConfig::Local(c) => Arc::new(LocalStore::init("local", &c.path).await?),
        DriverConfig::Nfs(c) => Arc::new(LocalStore::init("nfs", &c.path).await?),
        DriverConfig::S3(c) => Arc::new(S3Store::init(c).await?),
        DriverConfig::Webdav(c) => Arc::new(WebdavStore::init(c).await?),
        DriverConfig::Upstream(c) => Arc::new(UpstreamStore::init(c).await?),
        DriverConfig::Memory(_) => Arc::new(MemoryObjectStore::new()),
    };
    Ok(store)
}

/// A storage unit: one object store plus the unit's addressing scheme.
pub struct DriverUnit {
    name: String,
    id: RwLock<String>,
    store: Arc<dyn ObjectStore>,
    addressing: Addressing,
}

impl DriverUnit {
    #[must_use]
    pub fn new(name: &str, store: Arc<dyn ObjectStore>, addressing: Addressing) -> Self {
        Self { name: name.to_string(), id: RwLock::new(String::new()), store, addressing }
    }

    /// Build from a unit config: driver table plus encryption keys.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let addressing = Addressing::from_configs(&config.encryption)?;
        let store = build_object_store(&config.driver).await?;
        if store.is_read_only() && addressing.is_encrypting() {
            warn!(unit = %config.name, "Encryption keys ignored on a read-only unit");
            return Ok(Self::new(&config.name, store, Addressing::Identity));
        }
        Ok(Self::new(&config.name, store, addressing))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn item_hash<'a>(item: &'a Item) -> Result<&'a str, StorageError> {
        item.hash()
            .ok_or_else(|| StorageError::NotCompleted(item.id.clone()))
    }
}

impl Unit for DriverUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> String {
        self.id.read().clone()
    }

    fn bind(&self, record: &UnitRecord) {
        *self.id.write() = record.id.clone();
    }
}

#[async_trait]
impl StorageUnit for DriverUnit {
    fn new_locator(&self, hash: &str) -> String {
        self.addressing.locator(hash)
    }

    fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    async fn write(&self, iu: &ItemUnit, item: &Item, content: Bytes) -> Result<(), StorageError> {
        if self.store.is_read_only() {
            return Err(StorageError::Unsupported { unit: self.name.clone(), operation: "write".into() });
        }
        let hash = Self::item_hash(item)?;
        let object = if self.addressing.is_encrypting() {
            Bytes::from(self.addressing.seal(hash, &iu.item_id, &content)?)
        } else {
            content
        };
        self.store.put(&iu.locator, object).await
    }

    async fn read(&self, iu: &ItemUnit, item: &Item) -> Result<Bytes, StorageError> {
        let object = self.store.get(&iu.locator).await?;
        if self.store.is_read_only() {
            // upstream content predates digests and is returned as served
            return Ok(object);
        }
        let hash = Self::item_hash(item)?;
        let content = if self.addressing.is_encrypting() {
            Bytes::from(self.addressing.open(hash, &object)?)
        } else {
            object
        };
        let actual = ContentDigest::compute(&content).hash;
        if actual != hash {
            return Err(StorageError::Corruption {
                id: item.id.clone(),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    async fn remove(&self, iu: &ItemUnit) -> Result<(), StorageError> {
        match self.store.delete(&iu.locator).await {
            Err(StorageError::NotFound) => Ok(()),
            other => other,
        }
    }

    async fn item_exists(&self, iu: &ItemUnit) -> Result<bool, StorageError> {
        self.store.exists(&iu.locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::EncryptionConfig;
    use crate::item::{ApiRef, ItemStatus, ItemType, LogApiRef};

    fn completed_item(content: &[u8]) -> Item {
        let mut item = Item::new_incoming(
            ApiRef::Log(LogApiRef { project_key: "P".into(), run_id: 1, node_run_job_id: 2, ..Default::default() }),
            ItemType::StepLog,
        )
        .unwrap();
        item.status = ItemStatus::Completed;
        item.digest = Some(ContentDigest::compute(content));
        item
    }

    fn encrypted_unit(store: Arc<MemoryObjectStore>) -> DriverUnit {
        let addressing = Addressing::from_configs(&[EncryptionConfig {
            cipher: "aes-gcm".into(),
            locator_salt: "salt".into(),
            secret_value: "secret".into(),
        }])
        .unwrap();
        DriverUnit::new("enc", store, addressing)
    }

    #[tokio::test]
    async fn test_identity_write_read() {
        let store = Arc::new(MemoryObjectStore::new());
        let unit = DriverUnit::new("plain", store.clone(), Addressing::Identity);
        let item = completed_item(b"hello\n");
        let locator = unit.new_locator(item.hash().unwrap());
        let iu = ItemUnit::new(&item, "u1", locator.clone());

        unit.write(&iu, &item, Bytes::from_static(b"hello\n")).await.unwrap();
        assert_eq!(store.raw(&locator).unwrap(), Bytes::from_static(b"hello\n"));
        assert_eq!(unit.read(&iu, &item).await.unwrap(), Bytes::from_static(b"hello\n"));
        assert!(unit.item_exists(&iu).await.unwrap());
    }

    #[tokio::test]
    async fn test_encrypted_unit_stores_ciphertext() {
        let store = Arc::new(MemoryObjectStore::new());
        let unit = encrypted_unit(store.clone());
        let item = completed_item(b"secret log\n");
        let hash = item.hash().unwrap().to_string();
        let locator = unit.new_locator(&hash);
        assert_ne!(locator, hash);

        let iu = ItemUnit::new(&item, "u1", locator.clone());
        unit.write(&iu, &item, Bytes::from_static(b"secret log\n")).await.unwrap();

        let raw = store.raw(&locator).unwrap();
        assert!(!raw.windows(10).any(|w| w == b"secret log"));
        assert_eq!(unit.read(&iu, &item).await.unwrap(), Bytes::from_static(b"secret log\n"));
    }

    #[tokio::test]
    async fn test_corrupted_copy_detected() {
        let store = Arc::new(MemoryObjectStore::new());
        let unit = DriverUnit::new("plain", store.clone(), Addressing::Identity);
        let item = completed_item(b"good\n");
        let iu = ItemUnit::new(&item, "u1", unit.new_locator(item.hash().unwrap()));
        store.put(&iu.locator, Bytes::from_static(b"bad\n")).await.unwrap();

        let err = unit.read(&iu, &item).await.unwrap_err();
        assert!(matches!(err, StorageError::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let unit = DriverUnit::new("plain", Arc::new(MemoryObjectStore::new()), Addressing::Identity);
        let item = completed_item(b"x");
        let iu = ItemUnit::new(&item, "u1", "nope".into());
        unit.remove(&iu).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_requires_completed_item() {
        let unit = DriverUnit::new("plain", Arc::new(MemoryObjectStore::new()), Addressing::Identity);
        let mut item = completed_item(b"x");
        item.digest = None;
        let iu = ItemUnit::new(&item, "u1", "loc".into());
        let err = unit.write(&iu, &item, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, StorageError::NotCompleted(_)));
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let config = StorageConfig::new("mem", DriverConfig::Memory(Default::default()));
        let unit = DriverUnit::from_config(&config).await.unwrap();
        assert_eq!(unit.name(), "mem");
        assert_eq!(unit.store().driver(), "memory");
        assert!(!unit.is_read_only());
    }
}
