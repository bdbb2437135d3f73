// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered key-value/queue service.
//!
//! The buffer unit, the per-job ingestion queues, the drain leases and the
//! decoded-content LRU all sit on this contract:
//!
//! - ordered sets: add / replace-at-score / scan by rank
//! - strings: get / set with TTL / set-if-absent / counters
//! - lists: push / timeout-bounded pop
//!
//! [`RedisKv`] is the production backend, [`MemoryKv`] backs tests and single-node dev.

pub mod memory;
pub mod redis;

pub use memory::MemoryKv;
pub use self::redis::RedisKv;

use async_trait::async_trait;
use std::time::Duration;

use crate::storage::traits::StorageError;

#[async_trait]
pub trait KvStore: Send + Sync {
    // ── strings ──
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;
    /// Set only if absent. Returns true when the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;
    /// Increment an integer value (created at 0) and (re)arm its TTL.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    // ── ordered sets ──
    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError>;
    /// Atomically drop the members at exactly `score` that start with `prefix`,
    /// then add `member` at it. Members at that score with another prefix stay.
    async fn zreplace(&self, key: &str, score: f64, prefix: &str, member: &str) -> Result<(), StorageError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StorageError>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StorageError>;
    async fn zcard(&self, key: &str) -> Result<u64, StorageError>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError>;
    /// Members with scores by rank, inclusive `stop`, negative ranks count from the end.
    async fn zrange(&self, key: &str, start: i64, stop: i64, reverse: bool) -> Result<Vec<(String, f64)>, StorageError>;

    // ── lists ──
    async fn push(&self, key: &str, value: &str) -> Result<(), StorageError>;
    /// Pop the oldest value, waiting at most `timeout` for one to arrive.
    async fn pop_timeout(&self, key: &str, timeout: Duration) -> Result<Option<String>, StorageError>;
    async fn llen(&self, key: &str) -> Result<u64, StorageError>;
}

/// Resolve an inclusive rank window against a collection length.
pub(crate) fn rank_window(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len_i = len as i64;
    let norm = |r: i64| if r < 0 { len_i + r } else { r };
    let start = norm(start).max(0);
    let stop = norm(stop).min(len_i - 1);
    if start > stop || start >= len_i {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod tests {
    use super::rank_window;

    #[test]
    fn test_rank_window() {
        assert_eq!(rank_window(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_window(5, 1, 2), Some((1, 2)));
        assert_eq!(rank_window(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_window(5, 3, 100), Some((3, 4)));
        assert_eq!(rank_window(5, 6, 10), None);
        assert_eq!(rank_window(0, 0, -1), None);
    }
}
