// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Move dequeued fragments into the buffer and detect stream completion.
//!
//! A terminal fragment completes its item only once every earlier line is
//! buffered (distinct line numbers `>= line + 1`, resent lines count once).
//! If lines are still missing, the terminal
//! line number is remembered in the KV service and whichever late fragment
//! fills the last gap completes the item. A truncated terminal fragment does
//! not wait: the lines it replaces were dropped on purpose.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::handler::QueuedLine;
use super::terminated_key;
use crate::catalog::Catalog;
use crate::completion::{CompletionOutcome, Completer};
use crate::events::{EventBus, ItemEvent, ItemEventKind};
use crate::item::{now_millis, ApiRef, Item};
use crate::kv::KvStore;
use crate::metrics;
use crate::storage::traits::StorageError;
use crate::storage::{Position, RunningUnits};

/// Items are touched at most this often so stuck-item GC sees them as active.
const TOUCH_INTERVAL_MS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Buffered,
    /// Terminal line seen, earlier lines still missing.
    Waiting { missing: u64 },
    Completed,
    /// The item was already completed; the fragment is discarded.
    Ignored,
}

pub struct LogStore {
    catalog: Arc<Catalog>,
    units: Arc<RunningUnits>,
    kv: Arc<dyn KvStore>,
    completer: Arc<Completer>,
    events: EventBus,
    sync_trigger: Arc<Notify>,
    terminated_ttl: Duration,
}

impl LogStore {
    #[must_use]
    pub fn new(
        catalog: Arc<Catalog>,
        units: Arc<RunningUnits>,
        kv: Arc<dyn KvStore>,
        completer: Arc<Completer>,
        events: EventBus,
        sync_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            catalog,
            units,
            kv,
            completer,
            events,
            sync_trigger,
            terminated_ttl: Duration::from_secs(24 * 3600),
        }
    }

    /// Deserialize a raw queue entry and store it.
    pub async fn store_raw(&self, raw: &str) -> Result<StoreOutcome, StorageError> {
        let line: QueuedLine =
            serde_json::from_str(raw).map_err(|e| StorageError::InvalidData(format!("queued line: {}", e)))?;
        self.store(&line).await
    }

    pub async fn store(&self, line: &QueuedLine) -> Result<StoreOutcome, StorageError> {
        let api_ref = ApiRef::Log(line.signature.log_api_ref());
        let item = self.catalog.load_or_create_item(&api_ref, line.item_type).await?;
        if item.is_completed() {
            debug!(item_id = %item.id, line = line.line, "Fragment for completed item discarded");
            metrics::record_line_stored("late");
            return Ok(StoreOutcome::Ignored);
        }

        let buffer = self.units.buffer();
        let iu = self.units.buffer_item_unit(&self.catalog, &item).await?;
        let now = now_millis();
        buffer
            .add(&iu, Position::at(line.line, item.created, now), &line.content)
            .await
            .map_err(|e| {
                warn!(item_id = %item.id, api_ref_hash = %item.api_ref_hash, error = %e, "Cannot buffer fragment");
                e
            })?;
        metrics::record_line_stored("stored");

        if now - item.last_modified > TOUCH_INTERVAL_MS {
            self.catalog.touch_item(&item.id).await?;
        }
        self.publish(&item, ItemEventKind::Updated);

        let terminated_key = terminated_key(&item.id);
        let last_line = if line.terminated {
            self.kv
                .set(&terminated_key, &line.line.to_string(), Some(self.terminated_ttl))
                .await?;
            Some(line.line)
        } else {
            self.kv.get(&terminated_key).await?.and_then(|v| v.parse::<u64>().ok())
        };
        let Some(last_line) = last_line else {
            return Ok(StoreOutcome::Buffered);
        };

        let present = buffer.line_count(&iu).await?;
        if present < last_line + 1 && !line.truncated {
            let missing = last_line + 1 - present;
            debug!(item_id = %item.id, missing, "Terminal line received, waiting for earlier lines");
            return Ok(StoreOutcome::Waiting { missing });
        }

        self.complete(&item).await?;
        self.kv.delete(&terminated_key).await?;
        Ok(StoreOutcome::Completed)
    }

    async fn complete(&self, item: &Item) -> Result<(), StorageError> {
        match self.completer.complete_with_retry(&item.id).await {
            Ok(CompletionOutcome::Completed(completed)) => {
                self.publish(&completed, ItemEventKind::Completed);
                self.sync_trigger.notify_one();
                Ok(())
            }
            Ok(CompletionOutcome::AlreadyCompleted(_)) => Ok(()),
            Err(e) => {
                warn!(item_id = %item.id, api_ref_hash = %item.api_ref_hash, error = %e, "Completion failed, item left Incoming");
                Err(e)
            }
        }
    }

    fn publish(&self, item: &Item, kind: ItemEventKind) {
        self.events.publish(ItemEvent {
            kind,
            item_id: item.id.clone(),
            item_type: item.item_type,
            api_ref_hash: item.api_ref_hash.clone(),
        });
    }
}
