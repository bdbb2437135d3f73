// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Garbage collection passes.
//!
//! ```text
//! buffer reclaim   item held by (writable units + buffer) live placements
//!                  and buffered longer than buffer_min_age → mark buffer copy
//! stuck items      Incoming and untouched past incoming_timeout → force complete
//! unit purge       placements to delete → remove backing copy unless another
//!                  live item shares the locator → delete placement row
//! item purge       to-delete items without placements → delete item row
//! cache eviction   LogCache::evict on its own interval
//! ```
//!
//! Every pass is idempotent and tolerates running next to ingestion and sync.
//! Failures are per item: they are logged and counted, and the rest of the
//! batch carries on.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::catalog::{item_lock_key, Catalog};
use crate::completion::{CompletionOutcome, Completer};
use crate::config::{GcConfig, LruConfig};
use crate::eviction::LogCache;
use crate::item::{now_millis, ItemUnit};
use crate::metrics;
use crate::storage::traits::{BufferUnit, StorageError, StorageUnit};
use crate::storage::RunningUnits;
use crate::sync::PeriodicScheduler;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Backing copies deleted.
    pub removed: usize,
    /// Placement rows dropped while the object stays for another live item.
    pub shared: usize,
    /// Placement rows dropped.
    pub rows: usize,
    pub failed: usize,
}

impl PurgeReport {
    fn merge(&mut self, other: &PurgeReport) {
        self.removed += other.removed;
        self.shared += other.shared;
        self.rows += other.rows;
        self.failed += other.failed;
    }
}

pub struct GarbageCollector {
    catalog: Arc<Catalog>,
    units: Arc<RunningUnits>,
    completer: Arc<Completer>,
    cache: Option<Arc<LogCache>>,
    sync_trigger: Option<Arc<Notify>>,
    holder: String,
    config: GcConfig,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        units: Arc<RunningUnits>,
        completer: Arc<Completer>,
        holder: &str,
        config: &GcConfig,
    ) -> Self {
        Self {
            catalog,
            units,
            completer,
            cache: None,
            sync_trigger: None,
            holder: holder.to_string(),
            config: config.clone(),
        }
    }

    /// Drop purged items from the read cache too.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<LogCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Wake the sync engine when stuck items get completed.
    #[must_use]
    pub fn with_sync_trigger(mut self, trigger: Arc<Notify>) -> Self {
        self.sync_trigger = Some(trigger);
        self
    }

    pub fn schedule(self: &Arc<Self>, scheduler: &mut PeriodicScheduler, lru: &LruConfig) {
        let gc = Arc::clone(self);
        scheduler.every("gc:units", Duration::from_secs(self.config.interval_secs.max(1)), move || {
            let gc = Arc::clone(&gc);
            async move {
                gc.collect().await;
            }
        });

        let gc = Arc::clone(self);
        let timeout = Duration::from_secs(self.config.incoming_timeout_secs);
        scheduler.every("gc:incoming", Duration::from_secs(self.config.incoming_interval_secs.max(1)), move || {
            let gc = Arc::clone(&gc);
            async move {
                if let Err(e) = gc.complete_stuck_items(timeout).await {
                    warn!(error = %e, "Stuck item pass failed");
                }
            }
        });

        if let Some(cache) = self.cache.clone().filter(|c| c.is_enabled()) {
            scheduler.every("gc:lru", Duration::from_secs(lru.eviction_interval_secs.max(1)), move || {
                let cache = Arc::clone(&cache);
                async move {
                    if let Err(e) = cache.evict().await {
                        warn!(error = %e, "Log cache eviction failed");
                    }
                }
            });
        }
    }

    /// Buffer reclaim, then unit purge, then item purge.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) {
        if let Err(e) = self.reclaim_buffer().await {
            warn!(error = %e, "Buffer reclaim failed");
        }
        self.purge_units().await;
        if let Err(e) = self.purge_items().await {
            warn!(error = %e, "Item purge failed");
        }
    }

    /// Mark buffer copies of fully replicated items for deletion.
    #[tracing::instrument(skip(self))]
    pub async fn reclaim_buffer(&self) -> Result<usize, StorageError> {
        let writable = self.units.writable_storage_count();
        if writable == 0 {
            // the buffer is the only copy
            return Ok(0);
        }
        let buffer_id = self.units.buffer().id();
        let older_than = now_millis() - (self.config.buffer_min_age_secs as i64) * 1000;
        let ids = self
            .catalog
            .load_synchronized_item_ids(&buffer_id, writable as i64 + 1, older_than, self.config.batch_size)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let marked = self.catalog.mark_item_units_to_delete(&buffer_id, &ids).await? as usize;
        metrics::record_gc("buffer_reclaim", marked);
        info!(marked, "Buffer copies marked for deletion");
        Ok(marked)
    }

    /// Force-complete items whose producer stopped sending for `older_than`.
    #[tracing::instrument(skip(self))]
    pub async fn complete_stuck_items(&self, older_than: Duration) -> Result<usize, StorageError> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let items = self.catalog.load_incoming_items_older_than(cutoff, self.config.batch_size).await?;

        let mut completed = 0;
        for item in items {
            match self.completer.force_complete(&item.id).await {
                Ok(CompletionOutcome::Completed(done)) => {
                    completed += 1;
                    info!(item_id = %done.id, api_ref_hash = %done.api_ref_hash, size = done.size(), to_delete = done.to_delete, "Stuck item completed");
                }
                Ok(CompletionOutcome::AlreadyCompleted(_)) => {}
                Err(StorageError::Locked(_)) => debug!(item_id = %item.id, "Stuck item leased elsewhere"),
                Err(e) => warn!(item_id = %item.id, api_ref_hash = %item.api_ref_hash, error = %e, "Cannot complete stuck item"),
            }
        }
        if completed > 0 {
            metrics::record_gc("stuck_items", completed);
            if let Some(trigger) = &self.sync_trigger {
                trigger.notify_one();
            }
        }
        Ok(completed)
    }

    /// Purge every configured unit, buffer included.
    pub async fn purge_units(&self) -> PurgeReport {
        let mut total = PurgeReport::default();
        let mut unit_ids = vec![self.units.buffer().id()];
        unit_ids.extend(self.units.storages().iter().map(|s| s.unit.id()));
        for unit_id in unit_ids {
            match self.purge_unit(&unit_id).await {
                Ok(report) => total.merge(&report),
                Err(e) => {
                    warn!(unit_id = %unit_id, error = %e, "Unit purge failed");
                    total.failed += 1;
                }
            }
        }
        total
    }

    /// Remove copies and placement rows marked for deletion on one unit.
    #[tracing::instrument(skip(self))]
    pub async fn purge_unit(&self, unit_id: &str) -> Result<PurgeReport, StorageError> {
        let ius = self.catalog.load_item_units_to_delete(unit_id, self.config.batch_size).await?;
        let mut report = PurgeReport::default();
        if ius.is_empty() {
            return Ok(report);
        }

        let is_buffer = self.units.buffer().id() == unit_id;
        let storage = self.units.storage_by_id(unit_id).map(|s| s.unit.clone());

        for iu in &ius {
            let outcome = if is_buffer {
                self.purge_buffer_copy(self.units.buffer().as_ref(), iu).await
            } else if let Some(unit) = &storage {
                self.purge_storage_copy(unit.as_ref(), iu).await
            } else {
                Err(StorageError::NotFound)
            };
            let outcome = match outcome {
                Ok(disposal) => self.catalog.delete_item_unit(&iu.id).await.map(|()| disposal),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(disposal) => {
                    report.rows += 1;
                    match disposal {
                        Disposal::Removed => report.removed += 1,
                        Disposal::Shared => report.shared += 1,
                        Disposal::Kept => {}
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::record_error("gc", "purge_placement", e.kind());
                    warn!(item_id = %iu.item_id, unit_id, locator = %iu.locator, error = %e, "Cannot purge placement");
                }
            }
        }

        metrics::record_gc("unit_purge", report.rows);
        debug!(unit_id, rows = report.rows, removed = report.removed, shared = report.shared, "Unit purged");
        Ok(report)
    }

    async fn purge_buffer_copy(&self, buffer: &dyn BufferUnit, iu: &ItemUnit) -> Result<Disposal, StorageError> {
        match buffer.remove(iu).await {
            Ok(()) | Err(StorageError::NotFound) => Ok(Disposal::Removed),
            Err(e) => Err(e),
        }
    }

    async fn purge_storage_copy(&self, unit: &dyn StorageUnit, iu: &ItemUnit) -> Result<Disposal, StorageError> {
        if unit.is_read_only() {
            return Ok(Disposal::Kept);
        }
        if self
            .catalog
            .has_live_item_unit_with_locator(&iu.unit_id, &iu.locator, &iu.item_id)
            .await?
        {
            return Ok(Disposal::Shared);
        }
        if !unit.item_exists(iu).await? {
            return Ok(Disposal::Kept);
        }
        match unit.remove(iu).await {
            Ok(()) | Err(StorageError::NotFound) => Ok(Disposal::Removed),
            Err(e) => Err(e),
        }
    }

    /// Delete item rows that are marked and have no placement left.
    #[tracing::instrument(skip(self))]
    pub async fn purge_items(&self) -> Result<usize, StorageError> {
        let ids = self.catalog.load_item_ids_to_purge(self.config.batch_size).await?;
        let ttl = Duration::from_secs(self.config.item_lock_ttl_secs);

        let mut deleted = 0;
        for id in ids {
            let resource = item_lock_key(&id);
            match self.catalog.try_lock(&resource, &self.holder, ttl).await {
                Ok(()) => {}
                Err(StorageError::Locked(_)) => continue,
                Err(e) => {
                    warn!(item_id = %id, error = %e, "Cannot lease item for purge");
                    continue;
                }
            }
            let result = self.catalog.delete_item(&id).await;
            if let Err(e) = self.catalog.unlock(&resource, &self.holder).await {
                warn!(item_id = %id, error = %e, "Failed to release item lease, it will expire");
            }
            match result {
                Ok(()) => {
                    deleted += 1;
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.remove(&id).await {
                            debug!(item_id = %id, error = %e, "Cannot drop purged item from cache");
                        }
                    }
                }
                Err(e) => warn!(item_id = %id, error = %e, "Cannot delete item"),
            }
        }
        if deleted > 0 {
            metrics::record_gc("item_purge", deleted);
            info!(deleted, "Items purged");
        }
        Ok(deleted)
    }
}

enum Disposal {
    Removed,
    /// Another live item still uses the locator.
    Shared,
    /// Nothing to delete (read-only unit, or already gone).
    Kept,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::sqlite_catalog;
    use crate::item::{ApiRef, ContentDigest, Item, ItemStatus, ItemType, LogApiRef};
    use crate::kv::MemoryKv;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::{DriverUnit, KvBuffer, MemoryObjectStore, Position, RunningStorage};
    use crate::convergent::Addressing;
    use bytes::Bytes;

    struct Fixture {
        catalog: Arc<Catalog>,
        units: Arc<RunningUnits>,
        gc: GarbageCollector,
        store: Arc<MemoryObjectStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(storages: usize, config: GcConfig) -> Fixture {
        let (catalog, dir) = sqlite_catalog().await;
        let catalog = Arc::new(catalog);
        let buffer: Arc<dyn BufferUnit> = Arc::new(KvBuffer::new("buffer", Arc::new(MemoryKv::new())));
        let store = Arc::new(MemoryObjectStore::new());
        let running = (0..storages)
            .map(|i| {
                let unit = DriverUnit::new(&format!("unit-{}", i), store.clone(), Addressing::Identity);
                RunningStorage::new(Arc::new(unit))
            })
            .collect();
        let units = Arc::new(RunningUnits::with_units(&catalog, buffer, running).await.unwrap());
        let completer = Arc::new(
            Completer::new(catalog.clone(), units.clone(), "gc-test", Duration::from_secs(30)).with_retry(RetryConfig::test()),
        );
        let gc = GarbageCollector::new(catalog.clone(), units.clone(), completer, "gc-test", &config);
        Fixture { catalog, units, gc, store, _dir: dir }
    }

    fn young_buffer_config() -> GcConfig {
        GcConfig { buffer_min_age_secs: 0, ..Default::default() }
    }

    async fn incoming(f: &Fixture, run_id: i64, lines: &[&str]) -> Item {
        let api_ref = ApiRef::Log(LogApiRef { project_key: "P".into(), run_id, ..Default::default() });
        let item = f.catalog.load_or_create_item(&api_ref, ItemType::StepLog).await.unwrap();
        let iu = f.units.buffer_item_unit(&f.catalog, &item).await.unwrap();
        for (n, line) in lines.iter().enumerate() {
            f.units.buffer().add(&iu, Position::new(n as u64, 0), line).await.unwrap();
        }
        item
    }

    async fn completed_on_units(f: &Fixture, run_id: i64, content: &str) -> Item {
        let item = incoming(f, run_id, &[content]).await;
        f.catalog
            .complete_item_record(&item.id, &ContentDigest::compute(content.as_bytes()), false)
            .await
            .unwrap();
        let item = f.catalog.load_item(&item.id).await.unwrap().unwrap();
        for storage in f.units.storages() {
            let iu = ItemUnit::new(&item, &storage.unit.id(), storage.unit.new_locator(item.hash().unwrap()));
            storage.unit.write(&iu, &item, Bytes::from(content.to_string())).await.unwrap();
            f.catalog.insert_item_unit(&iu).await.unwrap();
        }
        item
    }

    #[tokio::test]
    async fn test_buffer_reclaim_waits_for_every_unit() {
        let f = fixture(2, young_buffer_config()).await;
        let item = completed_on_units(&f, 1, "x\n").await;
        let second = f.units.storages()[1].unit.id();
        let iu = f.catalog.load_item_unit(&second, &item.id).await.unwrap().unwrap();
        f.catalog.delete_item_unit(&iu.id).await.unwrap();

        assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 0);

        f.catalog.insert_item_unit(&iu).await.unwrap();
        assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 1);
        let buffered = f.catalog.load_item_unit(&f.units.buffer().id(), &item.id).await.unwrap().unwrap();
        assert!(buffered.to_delete);
    }

    #[tokio::test]
    async fn test_buffer_reclaim_respects_min_age() {
        let f = fixture(1, GcConfig { buffer_min_age_secs: 3600, ..Default::default() }).await;
        completed_on_units(&f, 1, "x\n").await;
        assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_buffer_never_reclaimed_without_storage() {
        let f = fixture(0, young_buffer_config()).await;
        let item = incoming(&f, 1, &["x\n"]).await;
        f.catalog.complete_item_record(&item.id, &ContentDigest::compute(b"x\n"), false).await.unwrap();
        assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stuck_item_completed_with_buffered_content() {
        let f = fixture(0, GcConfig::default()).await;
        let item = incoming(&f, 1, &["a\n", "b\n"]).await;

        assert_eq!(f.gc.complete_stuck_items(Duration::ZERO).await.unwrap(), 1);
        let item = f.catalog.load_item(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.size(), 4);
        assert!(!item.to_delete);
    }

    #[tokio::test]
    async fn test_stuck_item_without_buffer_is_completed_empty() {
        let f = fixture(0, GcConfig::default()).await;
        let api_ref = ApiRef::Log(LogApiRef { run_id: 5, ..Default::default() });
        let item = f.catalog.load_or_create_item(&api_ref, ItemType::StepLog).await.unwrap();

        assert_eq!(f.gc.complete_stuck_items(Duration::ZERO).await.unwrap(), 1);
        let item = f.catalog.load_item(&item.id).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.size(), 0);
        assert!(item.to_delete);
    }

    #[tokio::test]
    async fn test_recent_incoming_items_are_left_alone() {
        let f = fixture(0, GcConfig::default()).await;
        incoming(&f, 1, &["a\n"]).await;
        assert_eq!(f.gc.complete_stuck_items(Duration::from_secs(3600)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_removes_copies_and_rows() {
        let f = fixture(1, young_buffer_config()).await;
        let item = completed_on_units(&f, 1, "gone\n").await;
        assert_eq!(f.store.len(), 1);

        f.catalog.mark_item_to_delete(&item.id).await.unwrap();
        let report = f.gc.purge_units().await;
        assert_eq!(report.rows, 2);
        assert_eq!(report.removed, 2);
        assert!(f.store.is_empty());
        assert!(!f.units.buffer().exists(&ItemUnit::new(&item, &f.units.buffer().id(), item.id.clone())).await.unwrap());

        assert_eq!(f.gc.purge_items().await.unwrap(), 1);
        assert!(f.catalog.load_item(&item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_shared_object() {
        let f = fixture(1, young_buffer_config()).await;
        let a = completed_on_units(&f, 1, "same\n").await;
        let b = completed_on_units(&f, 2, "same\n").await;
        assert_eq!(f.store.len(), 1);

        f.catalog.mark_item_to_delete(&a.id).await.unwrap();
        let report = f.gc.purge_units().await;
        assert_eq!(report.shared, 1);
        assert_eq!(f.store.len(), 1);

        f.catalog.mark_item_to_delete(&b.id).await.unwrap();
        f.gc.purge_units().await;
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_purge_of_missing_copy_still_drops_row() {
        let f = fixture(1, young_buffer_config()).await;
        let item = completed_on_units(&f, 1, "x\n").await;
        let unit = &f.units.storages()[0].unit;
        let iu = f.catalog.load_item_unit(&unit.id(), &item.id).await.unwrap().unwrap();
        unit.remove(&iu).await.unwrap();

        f.catalog.mark_item_units_to_delete(&unit.id(), &[item.id.clone()]).await.unwrap();
        let report = f.gc.purge_unit(&unit.id()).await.unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(report.failed, 0);
        assert!(f.catalog.load_item_unit(&unit.id(), &item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_row_delete_does_not_stop_the_batch() {
        let f = fixture(1, young_buffer_config()).await;
        let stuck = completed_on_units(&f, 1, "stuck\n").await;
        let other = completed_on_units(&f, 2, "other\n").await;
        let unit_id = f.units.storages()[0].unit.id();
        f.catalog
            .mark_item_units_to_delete(&unit_id, &[stuck.id.clone(), other.id.clone()])
            .await
            .unwrap();

        let trigger = format!(
            "CREATE TRIGGER keep_row BEFORE DELETE ON item_unit WHEN OLD.item_id = '{}' \
             BEGIN SELECT RAISE(ABORT, 'row is pinned'); END",
            stuck.id
        );
        sqlx::query(&trigger).execute(&f.catalog.pool()).await.unwrap();

        let report = f.gc.purge_unit(&unit_id).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.rows, 1);
        assert!(f.catalog.load_item_unit(&unit_id, &other.id).await.unwrap().is_none());
        assert!(f.catalog.load_item_unit(&unit_id, &stuck.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_leased_item_is_not_purged() {
        let f = fixture(0, GcConfig::default()).await;
        let api_ref = ApiRef::Log(LogApiRef { run_id: 8, ..Default::default() });
        let item = f.catalog.load_or_create_item(&api_ref, ItemType::StepLog).await.unwrap();
        f.catalog.mark_item_to_delete(&item.id).await.unwrap();
        f.catalog.try_lock(&item_lock_key(&item.id), "other", Duration::from_secs(30)).await.unwrap();

        assert_eq!(f.gc.purge_items().await.unwrap(), 0);
        assert!(f.catalog.load_item(&item.id).await.unwrap().is_some());
    }
}
