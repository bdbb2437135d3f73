// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL catalog: the single source of truth for items, placements and units.
//!
//! ```sql
//! unit      (id PK, name UNIQUE, created, config)
//! item      (id PK, created, last_modified, api_ref, api_ref_hash, item_type,
//!            status, to_delete, hash, md5, size, run_id, live_key UNIQUE NULL)
//! item_unit (id PK, item_id, unit_id, locator, last_modified, item_type, to_delete,
//!            UNIQUE(item_id, unit_id))
//! lease     (resource PK, holder, expires_at)
//! ```
//!
//! `live_key` is `"{api_ref_hash}:{item_type}"` while the item is live and NULL
//! once it is marked for deletion, so the unique index only constrains live items.
//!
//! The `lease` table provides "lock or skip" semantics on both SQLite and MySQL:
//! taking a lease never blocks, a held lease surfaces as [`StorageError::Locked`].
//!
//! ## sqlx Any Driver Quirks
//!
//! Booleans are stored as integers, and MySQL TEXT columns may come back as
//! bytes, so string columns are read through [`get_string`].

mod items;
mod item_units;
mod lease;
mod units;

pub use lease::item_lock_key;

use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use crate::item::{ApiRef, ContentDigest, Item, ItemStatus, ItemType, ItemUnit, UnitRecord};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS unit (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        created INTEGER NOT NULL,
        config TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS item (
        id TEXT PRIMARY KEY,
        created INTEGER NOT NULL,
        last_modified INTEGER NOT NULL,
        api_ref TEXT NOT NULL,
        api_ref_hash TEXT NOT NULL,
        item_type TEXT NOT NULL,
        status TEXT NOT NULL,
        to_delete INTEGER NOT NULL DEFAULT 0,
        hash TEXT,
        md5 TEXT,
        size INTEGER,
        run_id INTEGER,
        live_key TEXT UNIQUE
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_item_status ON item (status, last_modified)",
    "CREATE INDEX IF NOT EXISTS idx_item_run ON item (run_id)",
    "CREATE INDEX IF NOT EXISTS idx_item_to_delete ON item (to_delete)",
    r#"CREATE TABLE IF NOT EXISTS item_unit (
        id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL,
        unit_id TEXT NOT NULL,
        locator TEXT NOT NULL,
        last_modified INTEGER NOT NULL,
        item_type TEXT NOT NULL,
        to_delete INTEGER NOT NULL DEFAULT 0,
        UNIQUE (item_id, unit_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_item_unit_locator ON item_unit (unit_id, locator)",
    "CREATE INDEX IF NOT EXISTS idx_item_unit_unit ON item_unit (unit_id, to_delete)",
    r#"CREATE TABLE IF NOT EXISTS lease (
        resource TEXT PRIMARY KEY,
        holder TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
];

const MYSQL_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS unit (
        id VARCHAR(64) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        created BIGINT NOT NULL,
        config TEXT NOT NULL,
        UNIQUE KEY uniq_unit_name (name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS item (
        id VARCHAR(64) PRIMARY KEY,
        created BIGINT NOT NULL,
        last_modified BIGINT NOT NULL,
        api_ref TEXT NOT NULL,
        api_ref_hash VARCHAR(64) NOT NULL,
        item_type VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL,
        to_delete TINYINT NOT NULL DEFAULT 0,
        hash VARCHAR(128),
        md5 VARCHAR(32),
        size BIGINT,
        run_id BIGINT,
        live_key VARCHAR(128),
        UNIQUE KEY uniq_item_live (live_key),
        INDEX idx_item_status (status, last_modified),
        INDEX idx_item_run (run_id),
        INDEX idx_item_to_delete (to_delete)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS item_unit (
        id VARCHAR(64) PRIMARY KEY,
        item_id VARCHAR(64) NOT NULL,
        unit_id VARCHAR(64) NOT NULL,
        locator VARCHAR(255) NOT NULL,
        last_modified BIGINT NOT NULL,
        item_type VARCHAR(32) NOT NULL,
        to_delete TINYINT NOT NULL DEFAULT 0,
        UNIQUE KEY uniq_item_unit (item_id, unit_id),
        INDEX idx_item_unit_locator (unit_id, locator),
        INDEX idx_item_unit_unit (unit_id, to_delete)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS lease (
        resource VARCHAR(255) PRIMARY KEY,
        holder VARCHAR(255) NOT NULL,
        expires_at BIGINT NOT NULL
    )"#,
];

pub struct Catalog {
    pool: AnyPool,
    is_sqlite: bool,
}

impl Catalog {
    /// Connect with startup-mode retry (fails fast if config is wrong) and create the schema.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("catalog_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 8 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let catalog = Self { pool, is_sqlite };
        if is_sqlite {
            catalog.enable_wal_mode().await?;
        }
        catalog.init_schema().await?;
        info!(sqlite = is_sqlite, "Catalog connected");
        Ok(catalog)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to apply '{}': {}", pragma, e)))?;
        }
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };
        for sql in statements.iter().copied() {
            retry("catalog_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Row helpers
// ═══════════════════════════════════════════════════════════════════════════

pub(crate) fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.is_unique_violation()
                || db.message().contains("UNIQUE constraint failed")
                || db.message().contains("Duplicate entry")
        }
        _ => false,
    }
}

/// Read a string column (SQLite TEXT as String, MySQL TEXT possibly as bytes).
pub(crate) fn get_string(row: &AnyRow, col: &str) -> Result<String, StorageError> {
    get_opt_string(row, col)?.ok_or_else(|| StorageError::InvalidData(format!("column '{}' is NULL", col)))
}

pub(crate) fn get_opt_string(row: &AnyRow, col: &str) -> Result<Option<String>, StorageError> {
    if let Ok(v) = row.try_get::<Option<String>, _>(col) {
        return Ok(v);
    }
    match row.try_get::<Option<Vec<u8>>, _>(col) {
        Ok(Some(bytes)) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StorageError::InvalidData(format!("column '{}': {}", col, e))),
        Ok(None) => Ok(None),
        Err(e) => Err(db_err(e)),
    }
}

pub(crate) fn get_i64(row: &AnyRow, col: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(col).map_err(db_err)
}

pub(crate) fn get_flag(row: &AnyRow, col: &str) -> Result<bool, StorageError> {
    // MySQL TINYINT may surface as a narrower integer through Any.
    match row.try_get::<i64, _>(col) {
        Ok(v) => Ok(v != 0),
        Err(_) => row.try_get::<i32, _>(col).map(|v| v != 0).or_else(|_| {
            row.try_get::<i16, _>(col).map(|v| v != 0).map_err(db_err)
        }),
    }
}

pub(crate) fn live_key(api_ref_hash: &str, item_type: ItemType) -> String {
    format!("{}:{}", api_ref_hash, item_type.as_str())
}

pub(crate) const ITEM_COLUMNS: &str =
    "id, created, last_modified, api_ref, api_ref_hash, item_type, status, to_delete, hash, md5, size";

pub(crate) fn item_from_row(row: &AnyRow) -> Result<Item, StorageError> {
    let item_type = ItemType::parse(&get_string(row, "item_type")?)?;
    let status = ItemStatus::parse(&get_string(row, "status")?)?;
    let api_ref = ApiRef::from_json(item_type, &get_string(row, "api_ref")?)?;

    let digest = match (get_opt_string(row, "hash")?, get_opt_string(row, "md5")?) {
        (Some(hash), Some(md5)) if status == ItemStatus::Completed => Some(ContentDigest {
            hash,
            md5,
            size: row.try_get::<Option<i64>, _>("size").map_err(db_err)?.unwrap_or(0),
        }),
        _ => None,
    };

    Ok(Item {
        id: get_string(row, "id")?,
        created: get_i64(row, "created")?,
        last_modified: get_i64(row, "last_modified")?,
        api_ref,
        api_ref_hash: get_string(row, "api_ref_hash")?,
        item_type,
        status,
        to_delete: get_flag(row, "to_delete")?,
        digest,
    })
}

pub(crate) const ITEM_UNIT_COLUMNS: &str = "id, item_id, unit_id, locator, last_modified, item_type, to_delete";

pub(crate) fn item_unit_from_row(row: &AnyRow) -> Result<ItemUnit, StorageError> {
    Ok(ItemUnit {
        id: get_string(row, "id")?,
        item_id: get_string(row, "item_id")?,
        unit_id: get_string(row, "unit_id")?,
        locator: get_string(row, "locator")?,
        last_modified: get_i64(row, "last_modified")?,
        item_type: ItemType::parse(&get_string(row, "item_type")?)?,
        to_delete: get_flag(row, "to_delete")?,
    })
}

pub(crate) fn unit_from_row(row: &AnyRow) -> Result<UnitRecord, StorageError> {
    Ok(UnitRecord {
        id: get_string(row, "id")?,
        name: get_string(row, "name")?,
        created: get_i64(row, "created")?,
        config: get_string(row, "config")?,
    })
}
