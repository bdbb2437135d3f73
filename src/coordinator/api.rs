// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read path and administrative operations.
//!
//! Reads:
//! - `get_item()` - Look up an item by its origin hash
//! - `get_item_content()` - Full content: LRU → buffer → storage unit
//! - `get_log_lines()` - Line window, from the buffer while it still holds the item
//!
//! Admin (called by the HTTP surface, which reports success as a status code):
//! - `mark_item_to_delete()` / `mark_run_to_delete()`
//! - `list_units()` / `delete_unit()` / `resync_unit()`
//! - `cache_status()` / `clear_cache()`

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::eviction::CacheStatus;
use crate::item::{Item, ItemStatus, ItemType};
use crate::storage::traits::{ReadOrder, StorageError};

use super::{CdnEngine, ResyncReport, UnitInfo};

/// Placements checked per catalog page during a resync.
const RESYNC_PAGE: i64 = 500;

impl CdnEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // Read path
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn get_item(&self, api_ref_hash: &str, item_type: ItemType) -> Result<Item, StorageError> {
        self.catalog()?
            .load_item_by_api_ref_hash(api_ref_hash, item_type)
            .await?
            .ok_or(StorageError::NotFound)
    }

    /// Full content of a completed item.
    ///
    /// Log items are served from the LRU when cached and cached after a
    /// backend read.
    #[tracing::instrument(skip(self))]
    pub async fn get_item_content(&self, item_id: &str) -> Result<Bytes, StorageError> {
        let c = self.components()?;
        let item = c.catalog.load_item(item_id).await?.ok_or(StorageError::NotFound)?;
        if item.status == ItemStatus::Incoming {
            return Err(StorageError::NotCompleted(item.id));
        }

        let is_log = item.item_type.is_log();
        if is_log {
            match c.cache.get(&item.id).await {
                Ok(Some(content)) => return Ok(content),
                Ok(None) => {}
                Err(e) => warn!(item_id = %item.id, error = %e, "LRU lookup failed, reading from backend"),
            }
        }

        let source = c.units.get_source(&c.catalog, &item).await?;
        let content = source.read(&item).await.map_err(|e| {
            warn!(item_id = %item.id, api_ref_hash = %item.api_ref_hash, error = %e, "Content read failed");
            e
        })?;

        if is_log {
            if let Err(e) = c.cache.put(&item, &content).await {
                debug!(item_id = %item.id, error = %e, "LRU put failed");
            }
        }
        Ok(content)
    }

    /// A window of `count` lines starting at index `from`.
    ///
    /// While the buffer holds the item (including while it is still being
    /// written) lines come straight from the buffer's ordered set. Afterwards
    /// the full content is split on line boundaries.
    pub async fn get_log_lines(
        &self,
        item_id: &str,
        from: u64,
        count: u64,
        order: ReadOrder,
    ) -> Result<Vec<String>, StorageError> {
        let c = self.components()?;
        let item = c.catalog.load_item(item_id).await?.ok_or(StorageError::NotFound)?;
        if !item.item_type.is_log() {
            return Err(StorageError::InvalidData(format!("item {} is not a log", item.id)));
        }

        let buffer = c.units.buffer();
        if let Some(iu) = c.catalog.load_item_unit(&buffer.id(), &item.id).await? {
            if !iu.to_delete {
                return buffer.read_range(&iu, from, count, order).await;
            }
        }

        let content = self.get_item_content(&item.id).await?;
        let text = String::from_utf8_lossy(&content);
        let mut lines: Vec<&str> = text.split_inclusive('\n').collect();
        if order == ReadOrder::Descending {
            lines.reverse();
        }
        Ok(lines
            .into_iter()
            .skip(from as usize)
            .take(count as usize)
            .map(str::to_string)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Admin
    // ═══════════════════════════════════════════════════════════════════════════

    /// Returns `false` when the item was unknown or already marked.
    pub async fn mark_item_to_delete(&self, item_id: &str) -> Result<bool, StorageError> {
        let marked = self.catalog()?.mark_item_to_delete(item_id).await?;
        if marked {
            info!(item_id, "Item marked to delete");
        }
        Ok(marked)
    }

    /// Mark every item of a workflow run. Returns how many were marked.
    pub async fn mark_run_to_delete(&self, run_id: i64) -> Result<u64, StorageError> {
        let marked = self.catalog()?.mark_items_to_delete_by_run_id(run_id).await?;
        info!(run_id, marked, "Run items marked to delete");
        Ok(marked)
    }

    /// Every unit known to the catalog, including ones no longer configured.
    pub async fn list_units(&self) -> Result<Vec<UnitInfo>, StorageError> {
        let c = self.components()?;
        let buffer_id = c.units.buffer().id();
        let records = c.catalog.load_all_units().await?;
        Ok(records
            .into_iter()
            .map(|r| UnitInfo {
                configured: c.units.is_configured(&r.id),
                is_buffer: r.id == buffer_id,
                id: r.id,
                name: r.name,
                created: r.created,
            })
            .collect())
    }

    /// Remove a unit that is no longer configured, with all of its placements.
    ///
    /// Returns the number of placement rows removed.
    #[tracing::instrument(skip(self))]
    pub async fn delete_unit(&self, name: &str) -> Result<u64, StorageError> {
        let c = self.components()?;
        let record = c.catalog.load_unit_by_name(name).await?.ok_or(StorageError::NotFound)?;
        if c.units.is_configured(&record.id) {
            return Err(StorageError::Conflict(format!("unit {} is still configured", name)));
        }
        let removed = c.catalog.delete_unit(&record.id).await?;
        info!(unit = %name, placements = removed, "Unit deleted");
        Ok(removed)
    }

    /// Check every placement of a configured unit against its backend.
    ///
    /// Placements whose copy is gone are dropped and a sync pass is
    /// triggered, so the next pass copies those items again.
    #[tracing::instrument(skip(self))]
    pub async fn resync_unit(&self, name: &str) -> Result<ResyncReport, StorageError> {
        let c = self.components()?;
        let record = c.catalog.load_unit_by_name(name).await?.ok_or(StorageError::NotFound)?;
        let storage = if c.units.buffer().id() == record.id {
            None
        } else {
            Some(c.units.storage_by_id(&record.id).ok_or(StorageError::NotFound)?)
        };

        let mut report = ResyncReport::default();
        let mut offset = 0i64;
        loop {
            let page = c.catalog.load_item_units_by_unit(&record.id, offset, RESYNC_PAGE).await?;
            if page.is_empty() {
                break;
            }
            let mut kept = 0i64;
            for iu in &page {
                report.checked += 1;
                let exists = match storage {
                    Some(s) => s.unit.item_exists(iu).await,
                    None => c.units.buffer().exists(iu).await,
                };
                match exists {
                    Ok(true) => kept += 1,
                    Ok(false) => {
                        c.catalog.delete_item_unit(&iu.id).await?;
                        report.dropped += 1;
                        debug!(unit = %name, item_id = %iu.item_id, "Dropped placement without backing copy");
                    }
                    Err(e) => {
                        kept += 1;
                        warn!(unit = %name, item_id = %iu.item_id, error = %e, "Existence check failed, placement kept");
                    }
                }
            }
            offset += kept;
        }

        if report.dropped > 0 {
            self.sync_trigger.notify_one();
        }
        info!(unit = %name, checked = report.checked, dropped = report.dropped, "Unit resynced");
        Ok(report)
    }

    pub async fn cache_status(&self) -> Result<CacheStatus, StorageError> {
        self.cache()?.status().await
    }

    pub async fn clear_cache(&self) -> Result<(), StorageError> {
        self.cache()?.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::started_engine;
    use super::*;
    use crate::ingest::message::build_line;
    use crate::ingest::test_support::step_signature;
    use crate::ingest::QueuedLine;
    use crate::item::{ApiRef, UnitRecord};

    fn line(n: u64, text: &str, terminated: bool) -> QueuedLine {
        QueuedLine {
            signature: step_signature(42, 1),
            item_type: ItemType::StepLog,
            line: n,
            content: build_line(6, text),
            terminated,
            truncated: false,
        }
    }

    fn api_ref_hash() -> String {
        ApiRef::Log(step_signature(42, 1).log_api_ref()).hash().unwrap()
    }

    async fn store_lines(engine: &CdnEngine, texts: &[&str], terminate: bool) -> Item {
        let store = engine.log_store().unwrap();
        for (i, text) in texts.iter().enumerate() {
            let last = terminate && i == texts.len() - 1;
            store.store(&line(i as u64, text, last)).await.unwrap();
        }
        engine.get_item(&api_ref_hash(), ItemType::StepLog).await.unwrap()
    }

    #[tokio::test]
    async fn test_incoming_content_not_completed() {
        let (engine, _dir) = started_engine().await;
        let item = store_lines(&engine, &["one", "two"], false).await;
        assert!(matches!(
            engine.get_item_content(&item.id).await,
            Err(StorageError::NotCompleted(_))
        ));

        let lines = engine.get_log_lines(&item.id, 0, 10, ReadOrder::Ascending).await.unwrap();
        assert_eq!(lines, vec!["[INFO] one\n", "[INFO] two\n"]);
    }

    #[tokio::test]
    async fn test_unknown_item() {
        let (engine, _dir) = started_engine().await;
        assert!(engine.get_item("nope", ItemType::StepLog).await.unwrap_err().is_not_found());
        assert!(engine.get_item_content("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_lines_after_buffer_reclaim() {
        let (engine, _dir) = started_engine().await;
        let item = store_lines(&engine, &["a", "b", "c"], true).await;
        assert!(item.is_completed());

        let report = engine.sync_engine().unwrap().sync_all().await;
        assert_eq!(report.copied, 1);
        assert_eq!(engine.garbage_collector().unwrap().reclaim_buffer().await.unwrap(), 1);

        let lines = engine.get_log_lines(&item.id, 1, 5, ReadOrder::Descending).await.unwrap();
        assert_eq!(lines, vec!["[INFO] b\n", "[INFO] a\n"]);

        let status = engine.cache_status().await.unwrap();
        assert_eq!(status.entries, 1);
        engine.clear_cache().await.unwrap();
        assert_eq!(engine.cache_status().await.unwrap().entries, 0);

        let content = engine.get_item_content(&item.id).await.unwrap();
        assert_eq!(&content[..], b"[INFO] a\n[INFO] b\n[INFO] c\n");
    }

    #[tokio::test]
    async fn test_mark_run_to_delete() {
        let (engine, _dir) = started_engine().await;
        let item = store_lines(&engine, &["x"], true).await;
        assert_eq!(engine.mark_run_to_delete(10).await.unwrap(), 1);
        assert!(!engine.mark_item_to_delete(&item.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_units_admin() {
        let (engine, _dir) = started_engine().await;
        engine
            .catalog()
            .unwrap()
            .insert_unit(&UnitRecord::new("retired", "{}".into()))
            .await
            .unwrap();

        let units = engine.list_units().await.unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units.iter().filter(|u| u.is_buffer).count(), 1);
        let retired = units.iter().find(|u| u.name == "retired").unwrap();
        assert!(!retired.configured);

        assert!(matches!(engine.delete_unit("memory-1").await, Err(StorageError::Conflict(_))));
        assert!(engine.delete_unit("ghost").await.unwrap_err().is_not_found());
        assert_eq!(engine.delete_unit("retired").await.unwrap(), 0);
        assert_eq!(engine.list_units().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resync_drops_missing_copies() {
        let (engine, _dir) = started_engine().await;
        let item = store_lines(&engine, &["only"], true).await;
        engine.sync_engine().unwrap().sync_all().await;

        let storage = engine.units().unwrap().storage("memory-1").unwrap().clone();
        let report = engine.resync_unit("memory-1").await.unwrap();
        assert_eq!(report, ResyncReport { checked: 1, dropped: 0 });

        let iu = engine
            .catalog()
            .unwrap()
            .load_item_unit(&storage.unit.id(), &item.id)
            .await
            .unwrap()
            .unwrap();
        storage.unit.remove(&iu).await.unwrap();

        let report = engine.resync_unit("memory-1").await.unwrap();
        assert_eq!(report, ResyncReport { checked: 1, dropped: 1 });

        let again = engine.sync_engine().unwrap().sync_all().await;
        assert_eq!(again.copied, 1);
        assert!(engine.resync_unit("ghost").await.unwrap_err().is_not_found());
    }
}
