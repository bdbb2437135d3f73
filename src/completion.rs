// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item finalization: Incoming → Completed, exactly once.
//!
//! ```text
//! try_lock(item:{id}) ──Locked──► caller backs off (RetryConfig::lock)
//!        │
//!        ▼
//! load item ── already Completed ──► AlreadyCompleted (benign)
//!        │
//!        ▼
//! read buffer → digest → UPDATE … WHERE status = 'Incoming'
//!        │
//!        ▼
//! unlock
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::{item_lock_key, Catalog};
use crate::item::{now_millis, ContentDigest, Item, ItemStatus};
use crate::metrics;
use crate::resilience::retry::{retry_if, RetryConfig};
use crate::storage::traits::StorageError;
use crate::storage::RunningUnits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    Completed(Item),
    /// Someone else completed it first.
    AlreadyCompleted(Item),
}

impl CompletionOutcome {
    #[must_use]
    pub fn item(&self) -> &Item {
        match self {
            Self::Completed(item) | Self::AlreadyCompleted(item) => item,
        }
    }
}

pub struct Completer {
    catalog: Arc<Catalog>,
    units: Arc<RunningUnits>,
    holder: String,
    lease_ttl: Duration,
    retry: RetryConfig,
}

impl Completer {
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, units: Arc<RunningUnits>, holder: &str, lease_ttl: Duration) -> Self {
        Self {
            catalog,
            units,
            holder: holder.to_string(),
            lease_ttl,
            retry: RetryConfig::lock(),
        }
    }

    /// Override the contention retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Complete from buffered content. Fails with `Locked` if the item lease is held.
    pub async fn complete(&self, item_id: &str) -> Result<CompletionOutcome, StorageError> {
        self.under_lease(item_id, false).await
    }

    /// [`Completer::complete`] with bounded retry on lease contention.
    pub async fn complete_with_retry(&self, item_id: &str) -> Result<CompletionOutcome, StorageError> {
        retry_if("complete_item", &self.retry, StorageError::is_locked, || self.complete(item_id)).await
    }

    /// Complete an item whose producer went away.
    ///
    /// With buffered content this is a normal completion. Without any buffer
    /// copy the item is completed empty and marked to delete.
    pub async fn force_complete(&self, item_id: &str) -> Result<CompletionOutcome, StorageError> {
        self.under_lease(item_id, true).await
    }

    async fn under_lease(&self, item_id: &str, allow_empty: bool) -> Result<CompletionOutcome, StorageError> {
        let resource = item_lock_key(item_id);
        if let Err(e) = self.catalog.try_lock(&resource, &self.holder, self.lease_ttl).await {
            if e.is_locked() {
                metrics::record_lock_contention("item");
            }
            return Err(e);
        }

        let timer = metrics::LatencyTimer::new("completion", "complete");
        let result = self.complete_locked(item_id, allow_empty).await;
        drop(timer);
        if let Err(e) = &result {
            metrics::record_error("completion", "complete", e.kind());
        }

        if let Err(e) = self.catalog.unlock(&resource, &self.holder).await {
            warn!(item_id, error = %e, "Failed to release item lease, it will expire");
        }
        result
    }

    async fn complete_locked(&self, item_id: &str, allow_empty: bool) -> Result<CompletionOutcome, StorageError> {
        let mut item = self.catalog.load_item(item_id).await?.ok_or(StorageError::NotFound)?;
        if item.is_completed() {
            debug!(item_id, "Item already completed");
            return Ok(CompletionOutcome::AlreadyCompleted(item));
        }

        let buffer = self.units.buffer();
        let buffered = self.catalog.load_item_unit(&buffer.id(), item_id).await?;

        let (digest, to_delete) = match buffered {
            Some(iu) => {
                let content = buffer.read(&iu).await.map_err(|e| {
                    warn!(item_id, api_ref_hash = %item.api_ref_hash, error = %e, "Cannot read buffered content");
                    e
                })?;
                (ContentDigest::compute(&content), false)
            }
            None if allow_empty => {
                info!(item_id, api_ref_hash = %item.api_ref_hash, "No buffered content, completing empty and marking to delete");
                (ContentDigest::compute(b""), true)
            }
            None => {
                // first completion registers the buffer placement
                let iu = self.units.buffer_item_unit(&self.catalog, &item).await?;
                let content = buffer.read(&iu).await?;
                (ContentDigest::compute(&content), false)
            }
        };

        if !self.catalog.complete_item_record(item_id, &digest, to_delete).await? {
            let current = self.catalog.load_item(item_id).await?.ok_or(StorageError::NotFound)?;
            return Ok(CompletionOutcome::AlreadyCompleted(current));
        }

        metrics::record_item_completed(item.item_type.as_str(), digest.size);
        debug!(item_id, size = digest.size, "Item completed");

        item.status = ItemStatus::Completed;
        item.last_modified = now_millis();
        item.to_delete = to_delete;
        item.digest = Some(digest);
        Ok(CompletionOutcome::Completed(item))
    }
}
