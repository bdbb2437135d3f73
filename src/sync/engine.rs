// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-unit promotion of completed items.
//!
//! ```text
//! load_item_ids_unknown_by_unit(dest, batch)
//!        │  (sync_parallel at a time)
//!        ▼
//! try_lock(item:{id}) ── Locked ──► skip, next tick retries
//!        │
//!        ▼
//! locator already live on dest ──► record placement only (dedup)
//!        │
//!        ▼
//! get_source → read → dest.write → insert item_unit → unlock
//! ```
//!
//! A placement row is only inserted after the destination write returned, so
//! a failed copy leaves nothing behind for GC to trust.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::scheduler::PeriodicScheduler;
use crate::catalog::{item_lock_key, Catalog};
use crate::item::{ContentDigest, Item, ItemUnit};
use crate::metrics;
use crate::storage::traits::StorageError;
use crate::storage::{RunningStorage, RunningUnits};

/// What happened to one item during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSync {
    Copied { bytes: usize },
    /// Identical content already stored under the same locator.
    Deduplicated,
    /// A placement appeared since the candidate query.
    Present,
    /// Leased elsewhere, deleted or not completed.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub candidates: usize,
    pub copied: usize,
    pub deduplicated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: &Result<ItemSync, StorageError>) {
        match outcome {
            Ok(ItemSync::Copied { .. }) => self.copied += 1,
            Ok(ItemSync::Deduplicated) => self.deduplicated += 1,
            Ok(ItemSync::Present | ItemSync::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: &SyncReport) {
        self.candidates += other.candidates;
        self.copied += other.copied;
        self.deduplicated += other.deduplicated;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

pub struct SyncEngine {
    catalog: Arc<Catalog>,
    units: Arc<RunningUnits>,
    holder: String,
    lease_ttl: Duration,
}

impl SyncEngine {
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, units: Arc<RunningUnits>, holder: &str, lease_ttl: Duration) -> Self {
        Self { catalog, units, holder: holder.to_string(), lease_ttl }
    }

    /// One loop per writable unit on its own interval, plus a pass over every
    /// unit whenever an item completes.
    pub fn schedule(self: &Arc<Self>, scheduler: &mut PeriodicScheduler, completed: Arc<Notify>) {
        for storage in self.units.storages().iter().filter(|s| !s.unit.is_read_only()) {
            let engine = Arc::clone(self);
            let name = storage.unit.name().to_string();
            scheduler.every(&format!("sync:{}", name), storage.sync_interval, move || {
                let engine = Arc::clone(&engine);
                let name = name.clone();
                async move {
                    if let Err(e) = engine.sync_unit(&name).await {
                        warn!(unit = %name, error = %e, "Sync pass failed");
                    }
                }
            });
        }

        let engine = Arc::clone(self);
        scheduler.on_notify("sync:on-complete", completed, move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.sync_all().await;
            }
        });
    }

    pub async fn sync_all(self: &Arc<Self>) -> SyncReport {
        let mut total = SyncReport::default();
        for storage in self.units.storages() {
            let name = storage.unit.name().to_string();
            match self.sync_unit(&name).await {
                Ok(report) => total.merge(&report),
                Err(e) => warn!(unit = %name, error = %e, "Sync pass failed"),
            }
        }
        total
    }

    /// Copy up to `sync_batch_size` items the unit does not hold yet.
    ///
    /// Per-item failures are counted, never returned: only a failing candidate
    /// query aborts the pass.
    #[tracing::instrument(skip(self), fields(unit = %name))]
    pub async fn sync_unit(self: &Arc<Self>, name: &str) -> Result<SyncReport, StorageError> {
        let storage = self.units.storage(name).ok_or(StorageError::NotFound)?.clone();
        if storage.unit.is_read_only() {
            return Ok(SyncReport::default());
        }

        let unit_id = storage.unit.id();
        let ids = self
            .catalog
            .load_item_ids_unknown_by_unit(&unit_id, storage.sync_batch_size as i64)
            .await?;
        metrics::set_sync_backlog(name, ids.len());
        let mut report = SyncReport { candidates: ids.len(), ..Default::default() };
        if ids.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(storage.sync_parallel.max(1)));
        let mut tasks = JoinSet::new();
        for item_id in ids {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let engine = Arc::clone(self);
            let dest = storage.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = engine.sync_item(&dest, &item_id).await;
                (item_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((item_id, outcome)) = joined else {
                report.failed += 1;
                continue;
            };
            match &outcome {
                Ok(ItemSync::Copied { bytes }) => {
                    metrics::record_sync(name, "copied");
                    metrics::record_sync_bytes(name, *bytes);
                }
                Ok(ItemSync::Deduplicated) => metrics::record_sync(name, "deduplicated"),
                Ok(_) => metrics::record_sync(name, "skipped"),
                Err(e) => {
                    metrics::record_sync(name, "error");
                    metrics::record_error("sync", "copy", e.kind());
                    warn!(unit = %name, item_id = %item_id, error = %e, "Item sync failed, retrying next pass");
                }
            }
            report.record(&outcome);
        }

        if report.copied + report.deduplicated > 0 || report.failed > 0 {
            info!(
                unit = %name,
                copied = report.copied,
                deduplicated = report.deduplicated,
                skipped = report.skipped,
                failed = report.failed,
                "Sync pass finished"
            );
        }
        Ok(report)
    }

    /// Copy one item to `dest` under its lease.
    pub async fn sync_item(&self, dest: &RunningStorage, item_id: &str) -> Result<ItemSync, StorageError> {
        let resource = item_lock_key(item_id);
        match self.catalog.try_lock(&resource, &self.holder, self.lease_ttl).await {
            Ok(()) => {}
            Err(StorageError::Locked(_)) => {
                metrics::record_lock_contention("item");
                debug!(item_id, "Item leased elsewhere, skipping");
                return Ok(ItemSync::Skipped);
            }
            Err(e) => return Err(e),
        }

        let timer = metrics::LatencyTimer::new("sync", "copy");
        let result = self.copy_locked(dest, item_id).await;
        drop(timer);

        if let Err(e) = self.catalog.unlock(&resource, &self.holder).await {
            warn!(item_id, error = %e, "Failed to release item lease, it will expire");
        }
        result
    }

    async fn copy_locked(&self, dest: &RunningStorage, item_id: &str) -> Result<ItemSync, StorageError> {
        let Some(item) = self.catalog.load_item(item_id).await? else {
            return Ok(ItemSync::Skipped);
        };
        if !item.is_completed() || item.to_delete {
            return Ok(ItemSync::Skipped);
        }
        let unit = &dest.unit;
        let unit_id = unit.id();
        if self.catalog.load_item_unit(&unit_id, item_id).await?.is_some() {
            return Ok(ItemSync::Present);
        }

        let hash = item.hash().ok_or_else(|| StorageError::NotCompleted(item.id.clone()))?;
        let iu = ItemUnit::new(&item, &unit_id, unit.new_locator(hash));

        if self.catalog.find_item_unit_with_locator(&unit_id, &iu.locator).await?.is_some()
            && unit.item_exists(&iu).await?
        {
            debug!(item_id, unit = %unit.name(), "Content already stored, recording placement");
            return self.record_placement(&iu, ItemSync::Deduplicated).await;
        }

        let content = self.read_source(&item).await?;
        let bytes = content.len();
        unit.write(&iu, &item, content).await.map_err(|e| {
            warn!(item_id, api_ref_hash = %item.api_ref_hash, unit = %unit.name(), error = %e, "Write to storage unit failed");
            e
        })?;
        self.record_placement(&iu, ItemSync::Copied { bytes }).await
    }

    async fn read_source(&self, item: &Item) -> Result<bytes::Bytes, StorageError> {
        let source = self.units.get_source(&self.catalog, item).await?;
        let content = source.read(item).await.map_err(|e| {
            warn!(item_id = %item.id, api_ref_hash = %item.api_ref_hash, unit = %source.unit_name(), error = %e, "Cannot read sync source");
            e
        })?;
        if source.is_buffer() {
            let expected = item.hash().unwrap_or_default();
            let actual = ContentDigest::compute(&content).hash;
            if actual != expected {
                metrics::record_corruption(source.unit_name());
                return Err(StorageError::Corruption { id: item.id.clone(), expected: expected.to_string(), actual });
            }
        }
        Ok(content)
    }

    async fn record_placement(&self, iu: &ItemUnit, outcome: ItemSync) -> Result<ItemSync, StorageError> {
        match self.catalog.insert_item_unit(iu).await {
            Ok(()) => Ok(outcome),
            Err(StorageError::Conflict(_)) => Ok(ItemSync::Present),
            Err(e) => Err(e),
        }
    }
}
