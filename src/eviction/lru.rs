// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decoded log content cache in the KV service.
//!
//! ```text
//! cdn:lru:index        zset  item_id → last use (logical clock)
//! cdn:lru:size         zset  item_id → content bytes
//! cdn:lru:item:{id}    string content
//! cdn:lru:clock        counter feeding the index scores
//! ```
//!
//! The clock is a KV counter rather than wall time so that two touches in the
//! same millisecond, from any node, still order strictly.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::LruConfig;
use crate::item::Item;
use crate::kv::KvStore;
use crate::metrics;
use crate::storage::traits::StorageError;

const INDEX_KEY: &str = "cdn:lru:index";
const SIZE_KEY: &str = "cdn:lru:size";
const CLOCK_KEY: &str = "cdn:lru:clock";

fn content_key(item_id: &str) -> String {
    format!("cdn:lru:item:{}", item_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatus {
    pub entries: u64,
    pub bytes: u64,
    pub max_bytes: u64,
}

pub struct LogCache {
    kv: Arc<dyn KvStore>,
    max_bytes: u64,
}

impl LogCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: &LruConfig) -> Self {
        Self { kv, max_bytes: config.max_bytes }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Cache the decoded content of a log item. Other item types, content
    /// larger than the whole cache and non-UTF-8 content are not cached.
    pub async fn put(&self, item: &Item, content: &Bytes) -> Result<bool, StorageError> {
        if !self.is_enabled() || !item.item_type.is_log() || content.len() as u64 > self.max_bytes {
            return Ok(false);
        }
        let Ok(text) = std::str::from_utf8(content) else {
            return Ok(false);
        };
        self.kv.set(&content_key(&item.id), text, None).await?;
        self.kv.zadd(SIZE_KEY, content.len() as f64, &item.id).await?;
        self.touch(&item.id).await?;
        Ok(true)
    }

    /// Cached content, refreshing its last use on a hit.
    pub async fn get(&self, item_id: &str) -> Result<Option<Bytes>, StorageError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        match self.kv.get(&content_key(item_id)).await? {
            Some(content) => {
                self.touch(item_id).await?;
                metrics::record_lru(true);
                Ok(Some(Bytes::from(content)))
            }
            None => {
                metrics::record_lru(false);
                // evicted content whose index entries survived a crash
                if self.kv.zscore(INDEX_KEY, item_id).await?.is_some() {
                    self.forget(item_id).await?;
                }
                Ok(None)
            }
        }
    }

    pub async fn remove(&self, item_id: &str) -> Result<(), StorageError> {
        self.forget(item_id).await
    }

    async fn touch(&self, item_id: &str) -> Result<(), StorageError> {
        let tick = self.kv.incr_by(CLOCK_KEY, 1, None).await?;
        self.kv.zadd(INDEX_KEY, tick as f64, item_id).await
    }

    async fn forget(&self, item_id: &str) -> Result<(), StorageError> {
        self.kv.delete(&content_key(item_id)).await?;
        self.kv.zrem(INDEX_KEY, item_id).await?;
        self.kv.zrem(SIZE_KEY, item_id).await
    }

    pub async fn total_bytes(&self) -> Result<u64, StorageError> {
        let sizes = self.kv.zrange(SIZE_KEY, 0, -1, false).await?;
        Ok(sizes.iter().map(|(_, size)| *size as u64).sum())
    }

    /// Drop least recently used entries until the total fits the cap.
    ///
    /// Returns the number of entries and bytes removed.
    #[tracing::instrument(skip(self))]
    pub async fn evict(&self) -> Result<(usize, u64), StorageError> {
        let mut total = self.total_bytes().await?;
        metrics::set_lru_bytes(total);
        if total <= self.max_bytes {
            return Ok((0, 0));
        }

        let (mut count, mut freed) = (0usize, 0u64);
        while total > self.max_bytes {
            let oldest = self.kv.zrange(INDEX_KEY, 0, 0, false).await?;
            let Some((item_id, _)) = oldest.into_iter().next() else {
                // sizes without an index entry: rebuild from scratch next time
                warn!(total, "Cache size set out of step with its index, clearing");
                self.clear().await?;
                return Ok((count, freed + total));
            };
            let size = self.kv.zscore(SIZE_KEY, &item_id).await?.map_or(0, |s| s as u64);
            self.forget(&item_id).await?;
            debug!(item_id = %item_id, size, "Evicted cached log");
            total = total.saturating_sub(size);
            freed += size;
            count += 1;
        }

        metrics::record_lru_eviction(count, freed);
        metrics::set_lru_bytes(total);
        info!(evicted = count, freed, remaining = total, "Log cache eviction");
        Ok((count, freed))
    }

    pub async fn status(&self) -> Result<CacheStatus, StorageError> {
        Ok(CacheStatus {
            entries: self.kv.zcard(INDEX_KEY).await?,
            bytes: self.total_bytes().await?,
            max_bytes: self.max_bytes,
        })
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        let entries = self.kv.zrange(SIZE_KEY, 0, -1, false).await?;
        for (item_id, _) in &entries {
            self.kv.delete(&content_key(item_id)).await?;
        }
        let indexed = self.kv.zrange(INDEX_KEY, 0, -1, false).await?;
        for (item_id, _) in &indexed {
            self.kv.delete(&content_key(item_id)).await?;
        }
        self.kv.delete(INDEX_KEY).await?;
        self.kv.delete(SIZE_KEY).await?;
        metrics::set_lru_bytes(0);
        Ok(())
    }
}
