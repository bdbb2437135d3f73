//! In-process [`KvStore`] for tests and single-node development.
//!
//! TTLs are enforced lazily on access. List pops wait on a [`Notify`] so a
//! blocked drainer wakes as soon as a producer pushes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::{rank_window, KvStore};
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}
impl Eq for Score {}
impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set with Redis ordering: by score, ties broken by member.
#[derive(Debug, Default)]
struct ZSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl ZSet {
    fn insert(&mut self, score: f64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(Score(old), member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn remove_by_score(&mut self, min: f64, max: f64) -> u64 {
        let doomed: Vec<String> = self
            .ordered
            .iter()
            .filter(|(s, _)| s.0 >= min && s.0 <= max)
            .map(|(_, m)| m.clone())
            .collect();
        for m in &doomed {
            self.remove(m);
        }
        doomed.len() as u64
    }
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

pub struct MemoryKv {
    strings: DashMap<String, Entry>,
    zsets: DashMap<String, ZSet>,
    lists: DashMap<String, VecDeque<String>>,
    pushed: Notify,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            zsets: DashMap::new(),
            lists: DashMap::new(),
            pushed: Notify::new(),
        }
    }

    fn live_string(&self, key: &str) -> Option<String> {
        let expired = match self.strings.get(key) {
            Some(e) if !e.is_expired() => return Some(e.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.strings.remove_if(key, |_, e| e.is_expired());
        }
        None
    }

    fn try_pop(&self, key: &str) -> Option<String> {
        let mut list = self.lists.get_mut(key)?;
        list.pop_front()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.live_string(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.strings.insert(
            key.to_string(),
            Entry { value: value.to_string(), expires_at: ttl.map(|t| Instant::now() + t) },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| Entry {
            value: String::new(),
            expires_at: Some(Instant::now()),
        });
        // A freshly inserted placeholder is already expired, so it is claimable too.
        if entry.is_expired() {
            entry.value = value.to_string();
            entry.expires_at = Some(Instant::now() + ttl);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = if entry.is_expired() {
            0
        } else {
            entry.value.parse().map_err(|_| {
                StorageError::InvalidData(format!("value at '{}' is not an integer", key))
            })?
        };
        let next = current + delta;
        entry.value = next.to_string();
        entry.expires_at = match ttl {
            Some(t) => Some(Instant::now() + t),
            None if entry.is_expired() => None,
            None => entry.expires_at,
        };
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StorageError> {
        match self.strings.get_mut(key) {
            Some(mut e) if !e.is_expired() => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.strings.remove(key);
        self.zsets.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.live_string(key).is_some()
            || self.zsets.get(key).is_some_and(|z| !z.scores.is_empty())
            || self.lists.get(key).is_some_and(|l| !l.is_empty()))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        self.zsets.entry(key.to_string()).or_default().insert(score, member);
        Ok(())
    }

    async fn zreplace(&self, key: &str, score: f64, prefix: &str, member: &str) -> Result<(), StorageError> {
        let mut zset = self.zsets.entry(key.to_string()).or_default();
        let doomed: Vec<String> = zset
            .ordered
            .iter()
            .filter(|(s, m)| *s == Score(score) && m.starts_with(prefix))
            .map(|(_, m)| m.clone())
            .collect();
        for m in &doomed {
            zset.remove(m);
        }
        zset.insert(score, member);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StorageError> {
        if let Some(mut z) = self.zsets.get_mut(key) {
            z.remove(member);
        }
        self.zsets.remove_if(key, |_, z| z.scores.is_empty());
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<u64, StorageError> {
        let removed = match self.zsets.get_mut(key) {
            Some(mut z) => z.remove_by_score(min, max),
            None => 0,
        };
        self.zsets.remove_if(key, |_, z| z.scores.is_empty());
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.zsets.get(key).map_or(0, |z| z.scores.len() as u64))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StorageError> {
        Ok(self.zsets.get(key).and_then(|z| z.scores.get(member).copied()))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64, reverse: bool) -> Result<Vec<(String, f64)>, StorageError> {
        let Some(zset) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let Some((from, to)) = rank_window(zset.ordered.len(), start, stop) else {
            return Ok(Vec::new());
        };
        let take = to - from + 1;
        let out = if reverse {
            zset.ordered.iter().rev().skip(from).take(take).map(|(s, m)| (m.clone(), s.0)).collect()
        } else {
            zset.ordered.iter().skip(from).take(take).map(|(s, m)| (m.clone(), s.0)).collect()
        };
        Ok(out)
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.lists.entry(key.to_string()).or_default().push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_timeout(&self, key: &str, timeout: Duration) -> Result<Option<String>, StorageError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and wait is not lost.
            notified.as_mut().enable();
            if let Some(v) = self.try_pop(key) {
                return Ok(Some(v));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(key));
            }
        }
    }

    async fn llen(&self, key: &str) -> Result<u64, StorageError> {
        Ok(self.lists.get(key).map_or(0, |l| l.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_and_get() {
        let kv = MemoryKv::new();
        kv.set("a", "1", None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(kv.get("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let kv = MemoryKv::new();
        kv.set("a", "1", Some(Duration::from_millis(20))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(kv.get("a").await.unwrap().is_none());
        assert!(!kv.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_nx_only_once_until_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("lease", "w1", Duration::from_millis(30)).await.unwrap());
        assert!(!kv.set_nx("lease", "w2", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(kv.set_nx("lease", "w2", Duration::from_millis(30)).await.unwrap());
        assert_eq!(kv.get("lease").await.unwrap().as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_incr_by() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("size", 10, None).await.unwrap(), 10);
        assert_eq!(kv.incr_by("size", 5, None).await.unwrap(), 15);
        kv.set("text", "abc", None).await.unwrap();
        assert!(kv.incr_by("text", 1, None).await.is_err());
    }

    #[tokio::test]
    async fn test_zset_orders_by_score_then_member() {
        let kv = MemoryKv::new();
        kv.zadd("z", 2.0, "b").await.unwrap();
        kv.zadd("z", 1.0, "z").await.unwrap();
        kv.zadd("z", 2.0, "a").await.unwrap();
        let all: Vec<String> = kv.zrange("z", 0, -1, false).await.unwrap().into_iter().map(|(m, _)| m).collect();
        assert_eq!(all, vec!["z", "a", "b"]);
        let rev: Vec<String> = kv.zrange("z", 0, 0, true).await.unwrap().into_iter().map(|(m, _)| m).collect();
        assert_eq!(rev, vec!["b"]);
    }

    #[tokio::test]
    async fn test_zreplace_overwrites_same_score_and_prefix() {
        let kv = MemoryKv::new();
        kv.zadd("z", 1.0, "a|old").await.unwrap();
        kv.zadd("z", 2.0, "a|keep").await.unwrap();
        kv.zreplace("z", 1.0, "a|", "a|new").await.unwrap();
        assert_eq!(kv.zcard("z").await.unwrap(), 2);
        assert_eq!(kv.zscore("z", "a|new").await.unwrap(), Some(1.0));
        assert_eq!(kv.zscore("z", "a|old").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zreplace_keeps_other_prefix_at_same_score() {
        let kv = MemoryKv::new();
        kv.zadd("z", 1.0, "a|first").await.unwrap();
        kv.zreplace("z", 1.0, "b|", "b|second").await.unwrap();
        assert_eq!(kv.zcard("z").await.unwrap(), 2);
        let all: Vec<String> = kv.zrange("z", 0, -1, false).await.unwrap().into_iter().map(|(m, _)| m).collect();
        assert_eq!(all, vec!["a|first", "b|second"]);
    }

    #[tokio::test]
    async fn test_zadd_existing_member_updates_score() {
        let kv = MemoryKv::new();
        kv.zadd("z", 1.0, "m").await.unwrap();
        kv.zadd("z", 5.0, "m").await.unwrap();
        assert_eq!(kv.zcard("z").await.unwrap(), 1);
        assert_eq!(kv.zscore("z", "m").await.unwrap(), Some(5.0));
    }

    #[tokio::test]
    async fn test_pop_timeout_returns_none_when_empty() {
        let kv = MemoryKv::new();
        let v = kv.pop_timeout("q", Duration::from_millis(20)).await.unwrap();
        assert!(v.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let kv = Arc::new(MemoryKv::new());
        let popper = {
            let kv = kv.clone();
            tokio::spawn(async move { kv.pop_timeout("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        kv.push("q", "hello").await.unwrap();
        let got = popper.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let kv = MemoryKv::new();
        kv.push("q", "1").await.unwrap();
        kv.push("q", "2").await.unwrap();
        assert_eq!(kv.llen("q").await.unwrap(), 2);
        assert_eq!(kv.pop_timeout("q", Duration::from_millis(1)).await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.pop_timeout("q", Duration::from_millis(1)).await.unwrap().as_deref(), Some("2"));
    }
}
