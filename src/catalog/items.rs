// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item rows.

use tracing::debug;

use super::{db_err, is_unique_violation, item_from_row, live_key, Catalog, ITEM_COLUMNS};
use crate::item::{now_millis, ApiRef, ContentDigest, Item, ItemType};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

impl Catalog {
    pub async fn insert_item(&self, item: &Item) -> Result<(), StorageError> {
        let api_ref = item.api_ref.to_json()?;
        let live = (!item.to_delete).then(|| live_key(&item.api_ref_hash, item.item_type));
        let digest = item.digest.as_ref();

        sqlx::query(
            "INSERT INTO item (id, created, last_modified, api_ref, api_ref_hash, item_type, status, to_delete, hash, md5, size, run_id, live_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(item.created)
        .bind(item.last_modified)
        .bind(&api_ref)
        .bind(&item.api_ref_hash)
        .bind(item.item_type.as_str())
        .bind(item.status.as_str())
        .bind(i64::from(item.to_delete))
        .bind(digest.map(|d| d.hash.clone()))
        .bind(digest.map(|d| d.md5.clone()))
        .bind(digest.map(|d| d.size))
        .bind(item.api_ref.run_id())
        .bind(live)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict(format!("item {} already exists", item.api_ref_hash))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    pub async fn load_item(&self, id: &str) -> Result<Option<Item>, StorageError> {
        let sql = format!("SELECT {} FROM item WHERE id = ?", ITEM_COLUMNS);
        retry("catalog_load_item", &RetryConfig::query(), || async {
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await.map_err(db_err)?;
            row.as_ref().map(item_from_row).transpose()
        })
        .await
    }

    /// Live item for an origin hash and type.
    pub async fn load_item_by_api_ref_hash(&self, api_ref_hash: &str, item_type: ItemType) -> Result<Option<Item>, StorageError> {
        let sql = format!("SELECT {} FROM item WHERE live_key = ?", ITEM_COLUMNS);
        let key = live_key(api_ref_hash, item_type);
        let row = sqlx::query(&sql).bind(&key).fetch_optional(&self.pool).await.map_err(db_err)?;
        row.as_ref().map(item_from_row).transpose()
    }

    /// Load the live item for this origin, creating it Incoming if absent.
    ///
    /// A concurrent creator winning the unique index is not an error: the row
    /// it inserted is reloaded and returned.
    pub async fn load_or_create_item(&self, api_ref: &ApiRef, item_type: ItemType) -> Result<Item, StorageError> {
        let hash = api_ref.hash()?;
        if let Some(existing) = self.load_item_by_api_ref_hash(&hash, item_type).await? {
            return Ok(existing);
        }

        let item = Item::new_incoming(api_ref.clone(), item_type)?;
        match self.insert_item(&item).await {
            Ok(()) => Ok(item),
            Err(StorageError::Conflict(_)) => {
                debug!(api_ref_hash = %hash, "Item created concurrently, reloading");
                self.load_item_by_api_ref_hash(&hash, item_type)
                    .await?
                    .ok_or_else(|| StorageError::Conflict(format!("item {} vanished after conflict", hash)))
            }
            Err(e) => Err(e),
        }
    }

    /// Flip an Incoming item to Completed with its digest.
    ///
    /// Returns false if the item was not Incoming (already completed by someone else).
    pub async fn complete_item_record(&self, id: &str, digest: &ContentDigest, to_delete: bool) -> Result<bool, StorageError> {
        let sql = if to_delete {
            "UPDATE item SET status = 'Completed', hash = ?, md5 = ?, size = ?, last_modified = ?, to_delete = 1, live_key = NULL
             WHERE id = ? AND status = 'Incoming'"
        } else {
            "UPDATE item SET status = 'Completed', hash = ?, md5 = ?, size = ?, last_modified = ?
             WHERE id = ? AND status = 'Incoming'"
        };
        let result = sqlx::query(sql)
            .bind(&digest.hash)
            .bind(&digest.md5)
            .bind(digest.size)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Bump last_modified of an Incoming item so stuck-item GC sees it as active.
    pub async fn touch_item(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE item SET last_modified = ? WHERE id = ? AND status = 'Incoming'")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn mark_item_to_delete(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE item SET to_delete = 1, live_key = NULL, last_modified = ? WHERE id = ? AND to_delete = 0")
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_items_to_delete_by_run_id(&self, run_id: i64) -> Result<u64, StorageError> {
        let result = sqlx::query("UPDATE item SET to_delete = 1, live_key = NULL, last_modified = ? WHERE run_id = ? AND to_delete = 0")
            .bind(now_millis())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// Incoming items untouched since `cutoff` (millis).
    pub async fn load_incoming_items_older_than(&self, cutoff: i64, limit: i64) -> Result<Vec<Item>, StorageError> {
        let sql = format!(
            "SELECT {} FROM item WHERE status = 'Incoming' AND to_delete = 0 AND last_modified <= ? ORDER BY last_modified LIMIT ?",
            ITEM_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(cutoff).bind(limit).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(item_from_row).collect()
    }

    /// Items marked to delete that no longer have any placement.
    pub async fn load_item_ids_to_purge(&self, limit: i64) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT i.id AS id FROM item i WHERE i.to_delete = 1
             AND NOT EXISTS (SELECT 1 FROM item_unit iu WHERE iu.item_id = i.id)
             LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| super::get_string(r, "id")).collect()
    }

    pub async fn delete_item(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM item WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn count_items(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM item").fetch_one(&self.pool).await.map_err(db_err)?;
        super::get_i64(&row, "n")
    }
}
