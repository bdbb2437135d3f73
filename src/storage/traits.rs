// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unit capability contracts and the engine-wide error type.
//!
//! ```text
//!                 ┌──────────────┐
//!                 │     Unit     │  name, id, bind(record)
//!                 └──────┬───────┘
//!          ┌─────────────┴─────────────┐
//!   ┌──────▼───────┐            ┌──────▼───────┐
//!   │  BufferUnit  │            │ StorageUnit  │
//!   │ ordered adds │            │ full copies  │
//!   └──────────────┘            └──────┬───────┘
//!                                      │ ObjectStore (one per driver family)
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::item::{Item, ItemUnit, UnitRecord};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Item {0} is not completed yet")]
    NotCompleted(String),
    #[error("Resource {0} is locked")]
    Locked(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Unit '{unit}' does not support {operation}")]
    Unsupported { unit: String, operation: String },
    #[error("Encryption error: {0}")]
    Crypto(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

impl StorageError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::NotCompleted(_) => "not_completed",
            Self::Locked(_) => "locked",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidData(_) => "invalid_data",
            Self::Unsupported { .. } => "unsupported",
            Self::Crypto(_) => "crypto",
            Self::Backend(_) => "backend",
            Self::Corruption { .. } => "corruption",
        }
    }
}

/// Sort order for ranged reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOrder {
    #[default]
    Ascending,
    Descending,
}

/// Identity shared by buffer and storage units.
pub trait Unit: Send + Sync {
    /// Configured name (stable across restarts).
    fn name(&self) -> &str;

    /// Catalog id. Empty until [`Unit::bind`] is called.
    fn id(&self) -> String;

    /// Bind the persisted record after first registration in the catalog.
    fn bind(&self, record: &UnitRecord);
}

/// Fast, ephemeral, append-ordered store for in-flight content.
#[async_trait]
pub trait BufferUnit: Unit {
    /// Add a value at a position score. Re-adding at the same position overwrites.
    async fn add(&self, iu: &ItemUnit, position: super::buffer::Position, value: &str) -> Result<(), StorageError>;

    /// Add a value after the current last position.
    async fn append(&self, iu: &ItemUnit, value: &str) -> Result<(), StorageError>;

    /// Number of fragments held for this placement.
    async fn card(&self, iu: &ItemUnit) -> Result<u64, StorageError>;

    /// Number of distinct line numbers held. A resent line counts once.
    async fn line_count(&self, iu: &ItemUnit) -> Result<u64, StorageError>;

    /// Full content in position order.
    async fn read(&self, iu: &ItemUnit) -> Result<Bytes, StorageError>;

    /// `count` fragments starting at fragment `from` in the given order.
    async fn read_range(&self, iu: &ItemUnit, from: u64, count: u64, order: ReadOrder) -> Result<Vec<String>, StorageError>;

    async fn remove(&self, iu: &ItemUnit) -> Result<(), StorageError>;

    async fn exists(&self, iu: &ItemUnit) -> Result<bool, StorageError>;
}

/// Durable backend holding full copies keyed by locator.
#[async_trait]
pub trait StorageUnit: Unit {
    /// Deterministic backend key for a content hash.
    fn new_locator(&self, hash: &str) -> String;

    /// Read-only units are sources only and never receive copies.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Write the full copy for an item. `iu.locator` must be `new_locator(item hash)`.
    async fn write(&self, iu: &ItemUnit, item: &Item, content: Bytes) -> Result<(), StorageError>;

    async fn read(&self, iu: &ItemUnit, item: &Item) -> Result<Bytes, StorageError>;

    /// Byte range `[offset, offset + len)` of the decoded copy.
    async fn read_range(&self, iu: &ItemUnit, item: &Item, offset: u64, len: u64) -> Result<Bytes, StorageError> {
        let full = self.read(iu, item).await?;
        let start = (offset as usize).min(full.len());
        let end = start.saturating_add(len as usize).min(full.len());
        Ok(full.slice(start..end))
    }

    /// Delete the copy. Implementations treat an absent copy as success.
    async fn remove(&self, iu: &ItemUnit) -> Result<(), StorageError>;

    async fn item_exists(&self, iu: &ItemUnit) -> Result<bool, StorageError>;
}

/// Raw driver contract: exists, write-full, read-full, delete. No partial updates.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Driver family name, for logs.
    fn driver(&self) -> &'static str;

    fn is_read_only(&self) -> bool {
        false
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
