// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Running units: the buffer plus every configured storage unit, bound to
//! their catalog records.

use bytes::Bytes;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::buffer::KvBuffer;
use super::traits::{BufferUnit, StorageError, StorageUnit};
use super::DriverUnit;
use crate::catalog::Catalog;
use crate::config::{StorageConfig, UnitsConfig};
use crate::item::{Item, ItemUnit};
use crate::kv::KvStore;

/// A storage unit with its sync schedule.
#[derive(Clone)]
pub struct RunningStorage {
    pub unit: Arc<dyn StorageUnit>,
    pub sync_interval: Duration,
    pub sync_batch_size: usize,
    pub sync_parallel: usize,
}

impl RunningStorage {
    #[must_use]
    pub fn new(unit: Arc<dyn StorageUnit>) -> Self {
        Self {
            unit,
            sync_interval: Duration::from_secs(60),
            sync_batch_size: 100,
            sync_parallel: 4,
        }
    }

    #[must_use]
    pub fn with_schedule(unit: Arc<dyn StorageUnit>, config: &StorageConfig) -> Self {
        Self {
            unit,
            sync_interval: Duration::from_secs(config.sync_interval_secs.max(1)),
            sync_batch_size: config.sync_batch_size,
            sync_parallel: config.sync_parallel,
        }
    }
}

/// Where content for an item can be read from.
pub enum Source {
    Buffer { unit: Arc<dyn BufferUnit>, iu: ItemUnit },
    Storage { unit: Arc<dyn StorageUnit>, iu: ItemUnit },
}

impl Source {
    pub async fn read(&self, item: &Item) -> Result<Bytes, StorageError> {
        match self {
            Self::Buffer { unit, iu } => unit.read(iu).await,
            Self::Storage { unit, iu } => unit.read(iu, item).await,
        }
    }

    #[must_use]
    pub fn unit_name(&self) -> &str {
        match self {
            Self::Buffer { unit, .. } => unit.name(),
            Self::Storage { unit, .. } => unit.name(),
        }
    }

    #[must_use]
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer { .. })
    }
}

pub struct RunningUnits {
    buffer: Arc<dyn BufferUnit>,
    storages: Vec<RunningStorage>,
}

impl RunningUnits {
    /// Build every configured unit and register it in the catalog.
    pub async fn init(catalog: &Catalog, config: &UnitsConfig, kv: Arc<dyn KvStore>) -> Result<Self, StorageError> {
        let buffer: Arc<dyn BufferUnit> = Arc::new(KvBuffer::new(&config.buffer_name, kv));
        let mut storages = Vec::with_capacity(config.storages.len());
        for storage_config in &config.storages {
            let unit = DriverUnit::from_config(storage_config).await.map_err(|e| {
                StorageError::Backend(format!("unit '{}' failed to start: {}", storage_config.name, e))
            })?;
            storages.push((
                RunningStorage::with_schedule(Arc::new(unit), storage_config),
                serde_json::to_string(&storage_config.driver.redacted())
                    .map_err(|e| StorageError::InvalidData(e.to_string()))?,
            ));
        }

        let record = catalog.load_or_create_unit(&config.buffer_name, r#"{"buffer":"kv"}"#.to_string()).await?;
        buffer.bind(&record);

        let mut running = Vec::with_capacity(storages.len());
        for (storage, redacted) in storages {
            let record = catalog.load_or_create_unit(storage.unit.name(), redacted).await?;
            storage.unit.bind(&record);
            info!(unit = %record.name, id = %record.id, read_only = storage.unit.is_read_only(), "Storage unit ready");
            running.push(storage);
        }

        Ok(Self { buffer, storages: running })
    }

    /// Register prebuilt units (tests, embedding).
    pub async fn with_units(catalog: &Catalog, buffer: Arc<dyn BufferUnit>, storages: Vec<RunningStorage>) -> Result<Self, StorageError> {
        let record = catalog.load_or_create_unit(buffer.name(), "{}".to_string()).await?;
        buffer.bind(&record);
        for storage in &storages {
            let record = catalog.load_or_create_unit(storage.unit.name(), "{}".to_string()).await?;
            storage.unit.bind(&record);
        }
        Ok(Self { buffer, storages })
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<dyn BufferUnit> {
        &self.buffer
    }

    #[must_use]
    pub fn storages(&self) -> &[RunningStorage] {
        &self.storages
    }

    #[must_use]
    pub fn storage(&self, name: &str) -> Option<&RunningStorage> {
        self.storages.iter().find(|s| s.unit.name() == name)
    }

    #[must_use]
    pub fn storage_by_id(&self, unit_id: &str) -> Option<&RunningStorage> {
        self.storages.iter().find(|s| s.unit.id() == unit_id)
    }

    /// Whether a unit id belongs to the running configuration.
    #[must_use]
    pub fn is_configured(&self, unit_id: &str) -> bool {
        self.buffer.id() == unit_id || self.storage_by_id(unit_id).is_some()
    }

    /// Storage units that accept copies.
    #[must_use]
    pub fn writable_storage_count(&self) -> usize {
        self.storages.iter().filter(|s| !s.unit.is_read_only()).count()
    }

    /// The item's buffer placement, created on first use.
    pub async fn buffer_item_unit(&self, catalog: &Catalog, item: &Item) -> Result<ItemUnit, StorageError> {
        let buffer_id = self.buffer.id();
        if let Some(iu) = catalog.load_item_unit(&buffer_id, &item.id).await? {
            return Ok(iu);
        }
        let iu = ItemUnit::new(item, &buffer_id, item.id.clone());
        match catalog.insert_item_unit(&iu).await {
            Ok(()) => Ok(iu),
            Err(StorageError::Conflict(_)) => catalog
                .load_item_unit(&buffer_id, &item.id)
                .await?
                .ok_or_else(|| StorageError::Conflict(format!("buffer placement of {} vanished", item.id))),
            Err(e) => Err(e),
        }
    }

    /// Pick a unit to read the item from.
    ///
    /// The buffer wins while it still holds the item. Otherwise a random live
    /// placement on a configured storage unit is chosen, spreading reads.
    /// Items that only exist upstream are served through a read-only unit.
    pub async fn get_source(&self, catalog: &Catalog, item: &Item) -> Result<Source, StorageError> {
        let ius = catalog.load_item_units_by_item(&item.id).await?;
        let buffer_id = self.buffer.id();

        if let Some(iu) = ius.iter().find(|iu| iu.unit_id == buffer_id && !iu.to_delete) {
            return Ok(Source::Buffer { unit: self.buffer.clone(), iu: iu.clone() });
        }

        let candidates: Vec<(&RunningStorage, &ItemUnit)> = ius
            .iter()
            .filter(|iu| !iu.to_delete)
            .filter_map(|iu| self.storage_by_id(&iu.unit_id).map(|s| (s, iu)))
            .collect();
        if let Some((storage, iu)) = candidates.choose(&mut rand::thread_rng()) {
            return Ok(Source::Storage { unit: storage.unit.clone(), iu: (*iu).clone() });
        }

        for storage in self.storages.iter().filter(|s| s.unit.is_read_only()) {
            let iu = ItemUnit::new(item, &storage.unit.id(), item.api_ref_hash.clone());
            match storage.unit.item_exists(&iu).await {
                Ok(true) => return Ok(Source::Storage { unit: storage.unit.clone(), iu }),
                Ok(false) => {}
                Err(e) => warn!(unit = %storage.unit.name(), item_id = %item.id, error = %e, "Read-only unit lookup failed"),
            }
        }

        warn!(item_id = %item.id, placements = ius.len(), "No readable source for item");
        Err(StorageError::NotFound)
    }
}
