// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Buffer unit: per-item ordered set of log fragments in the KV service.
//!
//! # Position scoring
//!
//! Fragments of one stream are ordered by a composite position:
//!
//! ```text
//! score = line + offset / 1e9
//!         │      └─ milliseconds since item creation (sub-line order)
//!         └─ producer line counter
//! ```
//!
//! Concurrent writers on the same stream get a total order without any shared
//! counter. The composite is kept as fixed-point integers and rendered as a
//! zero-padded key that prefixes each member (`{key}|{content}`), so:
//!
//! - identical lines at different positions remain distinct members
//! - if two positions ever round to the same f64, the exact key still orders them
//! - re-adding at a position replaces what was there instead of duplicating it
//!
//! A companion set (`{key}:lines`) records each line number once, so a resent
//! line never passes for a missing one when checking stream completeness.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;

use super::traits::{BufferUnit, ReadOrder, StorageError, Unit};
use crate::item::{ItemUnit, UnitRecord};
use crate::kv::KvStore;

/// Largest sub-line offset representable below the next line.
const MAX_OFFSET: u64 = 999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub line: u64,
    /// Milliseconds since item creation, clamped to stay below the next line.
    pub offset: u64,
}

impl Position {
    #[must_use]
    pub fn new(line: u64, offset: u64) -> Self {
        Self { line, offset: offset.min(MAX_OFFSET) }
    }

    /// Position for a fragment stamped `now_ms` on an item created at `created_ms`.
    #[must_use]
    pub fn at(line: u64, created_ms: i64, now_ms: i64) -> Self {
        Self::new(line, now_ms.saturating_sub(created_ms).max(0) as u64)
    }

    #[must_use]
    pub fn score(&self) -> f64 {
        self.line as f64 + self.offset as f64 / 1e9
    }

    /// Exact, lexicographically ordered rendering.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{:015}.{:09}", self.line, self.offset)
    }
}

/// Split a stored member into its position key and content.
fn member_content(member: &str) -> &str {
    member.split_once('|').map_or(member, |(_, content)| content)
}

pub struct KvBuffer {
    name: String,
    id: RwLock<String>,
    kv: Arc<dyn KvStore>,
}

impl KvBuffer {
    #[must_use]
    pub fn new(name: &str, kv: Arc<dyn KvStore>) -> Self {
        Self { name: name.to_string(), id: RwLock::new(String::new()), kv }
    }

    #[must_use]
    pub fn key(iu: &ItemUnit) -> String {
        format!("cdn:buffer:{}", iu.item_id)
    }

    fn lines_key(iu: &ItemUnit) -> String {
        format!("cdn:buffer:{}:lines", iu.item_id)
    }
}

impl Unit for KvBuffer {
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
impl BufferUnit for KvBuffer {
    async fn add(&self, iu: &ItemUnit, position: Position, value: &str) -> Result<(), StorageError> {
        let prefix = format!("{}|", position.key());
        let member = format!("{}{}", prefix, value);
        self.kv.zreplace(&Self::key(iu), position.score(), &prefix, &member).await?;
        self.kv
            .zadd(&Self::lines_key(iu), position.line as f64, &position.line.to_string())
            .await
    }

    async fn append(&self, iu: &ItemUnit, value: &str) -> Result<(), StorageError> {
        let last = self.kv.zrange(&Self::key(iu), -1, -1, false).await?;
        let next_line = last.first().map_or(0, |(_, score)| score.floor() as u64 + 1);
        self.add(iu, Position::new(next_line, 0), value).await
    }

    async fn card(&self, iu: &ItemUnit) -> Result<u64, StorageError> {
        self.kv.zcard(&Self::key(iu)).await
    }

    async fn line_count(&self, iu: &ItemUnit) -> Result<u64, StorageError> {
        self.kv.zcard(&Self::lines_key(iu)).await
    }

    async fn read(&self, iu: &ItemUnit) -> Result<Bytes, StorageError> {
        let members = self.kv.zrange(&Self::key(iu), 0, -1, false).await?;
        let mut content = String::new();
        for (member, _) in &members {
            content.push_str(member_content(member));
        }
        Ok(Bytes::from(content))
    }

    async fn read_range(&self, iu: &ItemUnit, from: u64, count: u64, order: ReadOrder) -> Result<Vec<String>, StorageError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let start = from as i64;
        let stop = start + count as i64 - 1;
        let members = self
            .kv
            .zrange(&Self::key(iu), start, stop, order == ReadOrder::Descending)
            .await?;
        Ok(members.iter().map(|(m, _)| member_content(m).to_string()).collect())
    }

    async fn remove(&self, iu: &ItemUnit) -> Result<(), StorageError> {
        self.kv.delete(&Self::key(iu)).await?;
        self.kv.delete(&Self::lines_key(iu)).await
    }

    async fn exists(&self, iu: &ItemUnit) -> Result<bool, StorageError> {
        Ok(self.card(iu).await? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ItemType;
    use crate::kv::MemoryKv;

    fn iu(item_id: &str) -> ItemUnit {
        ItemUnit {
            id: "iu".into(),
            item_id: item_id.into(),
            unit_id: "buffer".into(),
            locator: item_id.into(),
            last_modified: 0,
            item_type: ItemType::StepLog,
            to_delete: false,
        }
    }

    fn buffer() -> KvBuffer {
        KvBuffer::new("redis-buffer", Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_position_score_and_key_agree() {
        let a = Position::new(1, 500);
        let b = Position::new(1, 501);
        let c = Position::new(2, 0);
        assert!(a.score() < b.score() && b.score() < c.score());
        assert!(a.key() < b.key() && b.key() < c.key());
    }

    #[test]
    fn test_position_offset_is_clamped_below_next_line() {
        let p = Position::at(3, 0, i64::MAX);
        assert!(p.score() < 4.0);
        assert_eq!(Position::at(3, 100, 50).offset, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_adds_read_in_position_order() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(2, 0), "c\n").await.unwrap();
        buf.add(&unit, Position::new(0, 0), "a\n").await.unwrap();
        buf.add(&unit, Position::new(1, 0), "b\n").await.unwrap();
        assert_eq!(buf.read(&unit).await.unwrap(), Bytes::from("a\nb\nc\n"));
    }

    #[tokio::test]
    async fn test_same_position_overwrites() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(1, 10), "first\n").await.unwrap();
        buf.add(&unit, Position::new(1, 10), "second\n").await.unwrap();
        assert_eq!(buf.card(&unit).await.unwrap(), 1);
        assert_eq!(buf.read(&unit).await.unwrap(), Bytes::from("second\n"));
    }

    #[tokio::test]
    async fn test_identical_lines_are_kept() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(0, 0), "same\n").await.unwrap();
        buf.add(&unit, Position::new(1, 0), "same\n").await.unwrap();
        assert_eq!(buf.card(&unit).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_positions_with_equal_score_are_both_kept() {
        let buf = buffer();
        let unit = iu("item-1");
        // 2^53 + 1 is not representable, both round to the same score
        let a = Position::new(1 << 53, 0);
        let b = Position::new((1 << 53) + 1, 0);
        assert_eq!(a.score(), b.score());
        buf.add(&unit, b, "b\n").await.unwrap();
        buf.add(&unit, a, "a\n").await.unwrap();
        assert_eq!(buf.card(&unit).await.unwrap(), 2);
        assert_eq!(buf.read(&unit).await.unwrap(), Bytes::from("a\nb\n"));
    }

    #[tokio::test]
    async fn test_resent_line_counts_once() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(0, 10), "zero\n").await.unwrap();
        buf.add(&unit, Position::new(0, 15), "zero\n").await.unwrap();
        buf.add(&unit, Position::new(2, 20), "two\n").await.unwrap();
        assert_eq!(buf.card(&unit).await.unwrap(), 3);
        assert_eq!(buf.line_count(&unit).await.unwrap(), 2);

        buf.remove(&unit).await.unwrap();
        assert_eq!(buf.line_count(&unit).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_content_may_contain_separator() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(0, 0), "a|b|c\n").await.unwrap();
        assert_eq!(buf.read(&unit).await.unwrap(), Bytes::from("a|b|c\n"));
    }

    #[tokio::test]
    async fn test_append_goes_after_last_line() {
        let buf = buffer();
        let unit = iu("item-1");
        buf.add(&unit, Position::new(4, 20), "x\n").await.unwrap();
        buf.append(&unit, "y\n").await.unwrap();
        assert_eq!(buf.read(&unit).await.unwrap(), Bytes::from("x\ny\n"));
    }

    #[tokio::test]
    async fn test_read_range() {
        let buf = buffer();
        let unit = iu("item-1");
        for i in 0..5 {
            buf.add(&unit, Position::new(i, 0), &format!("{}\n", i)).await.unwrap();
        }
        let asc = buf.read_range(&unit, 1, 2, ReadOrder::Ascending).await.unwrap();
        assert_eq!(asc, vec!["1\n", "2\n"]);
        let desc = buf.read_range(&unit, 0, 2, ReadOrder::Descending).await.unwrap();
        assert_eq!(desc, vec!["4\n", "3\n"]);
    }

    #[tokio::test]
    async fn test_remove_and_exists() {
        let buf = buffer();
        let unit = iu("item-1");
        assert!(!buf.exists(&unit).await.unwrap());
        buf.append(&unit, "x\n").await.unwrap();
        assert!(buf.exists(&unit).await.unwrap());
        buf.remove(&unit).await.unwrap();
        assert!(!buf.exists(&unit).await.unwrap());
    }

    #[test]
    fn test_bind_sets_id() {
        let buf = buffer();
        assert_eq!(buf.id(), "");
        buf.bind(&UnitRecord::new("redis-buffer", "{}".into()));
        assert!(!buf.id().is_empty());
    }
}
