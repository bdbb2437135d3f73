// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Placement (item_unit) rows.

use super::{db_err, get_string, is_unique_violation, item_unit_from_row, Catalog, ITEM_UNIT_COLUMNS};
use crate::item::{now_millis, ItemUnit};
use crate::storage::traits::StorageError;

impl Catalog {
    /// Record a placement. A second placement for the same (item, unit) is a `Conflict`.
    pub async fn insert_item_unit(&self, iu: &ItemUnit) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO item_unit (id, item_id, unit_id, locator, last_modified, item_type, to_delete)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&iu.id)
        .bind(&iu.item_id)
        .bind(&iu.unit_id)
        .bind(&iu.locator)
        .bind(iu.last_modified)
        .bind(iu.item_type.as_str())
        .bind(i64::from(iu.to_delete))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StorageError::Conflict(format!("item {} already placed on unit {}", iu.item_id, iu.unit_id))
            } else {
                db_err(e)
            }
        })?;
        Ok(())
    }

    pub async fn load_item_unit(&self, unit_id: &str, item_id: &str) -> Result<Option<ItemUnit>, StorageError> {
        let sql = format!("SELECT {} FROM item_unit WHERE unit_id = ? AND item_id = ?", ITEM_UNIT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(unit_id)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(item_unit_from_row).transpose()
    }

    pub async fn load_item_units_by_item(&self, item_id: &str) -> Result<Vec<ItemUnit>, StorageError> {
        let sql = format!("SELECT {} FROM item_unit WHERE item_id = ?", ITEM_UNIT_COLUMNS);
        let rows = sqlx::query(&sql).bind(item_id).fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(item_unit_from_row).collect()
    }

    pub async fn load_item_units_by_unit(&self, unit_id: &str, offset: i64, limit: i64) -> Result<Vec<ItemUnit>, StorageError> {
        let sql = format!(
            "SELECT {} FROM item_unit WHERE unit_id = ? AND to_delete = 0 ORDER BY last_modified, id LIMIT ? OFFSET ?",
            ITEM_UNIT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(unit_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(item_unit_from_row).collect()
    }

    /// Placements on a unit that must go: flagged themselves, or their item is.
    pub async fn load_item_units_to_delete(&self, unit_id: &str, limit: i64) -> Result<Vec<ItemUnit>, StorageError> {
        let rows = sqlx::query(
            "SELECT iu.id AS id, iu.item_id AS item_id, iu.unit_id AS unit_id, iu.locator AS locator,
                    iu.last_modified AS last_modified, iu.item_type AS item_type, iu.to_delete AS to_delete
             FROM item_unit iu JOIN item i ON i.id = iu.item_id
             WHERE iu.unit_id = ? AND (iu.to_delete = 1 OR i.to_delete = 1)
             ORDER BY iu.last_modified
             LIMIT ?",
        )
        .bind(unit_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(item_unit_from_row).collect()
    }

    pub async fn mark_item_units_to_delete(&self, unit_id: &str, item_ids: &[String]) -> Result<u64, StorageError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut marked = 0;
        let now = now_millis();
        for item_id in item_ids {
            let result = sqlx::query("UPDATE item_unit SET to_delete = 1, last_modified = ? WHERE unit_id = ? AND item_id = ? AND to_delete = 0")
                .bind(now)
                .bind(unit_id)
                .bind(item_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            marked += result.rows_affected();
        }
        tx.commit().await.map_err(db_err)?;
        Ok(marked)
    }

    pub async fn delete_item_unit(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM item_unit WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Does any *other* live item still use this locator on this unit?
    ///
    /// This is the reference count guarding deletion of deduplicated objects.
    pub async fn has_live_item_unit_with_locator(&self, unit_id: &str, locator: &str, exclude_item_id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT 1 AS found FROM item_unit iu JOIN item i ON i.id = iu.item_id
             WHERE iu.unit_id = ? AND iu.locator = ? AND iu.item_id <> ?
               AND iu.to_delete = 0 AND i.to_delete = 0
             LIMIT 1",
        )
        .bind(unit_id)
        .bind(locator)
        .bind(exclude_item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Any live placement on this unit with this locator (dedup probe before copying).
    pub async fn find_item_unit_with_locator(&self, unit_id: &str, locator: &str) -> Result<Option<ItemUnit>, StorageError> {
        let sql = format!(
            "SELECT {} FROM item_unit WHERE unit_id = ? AND locator = ? AND to_delete = 0 LIMIT 1",
            ITEM_UNIT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(unit_id)
            .bind(locator)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(item_unit_from_row).transpose()
    }

    /// Items whose buffer placement is older than `buffer_older_than` and which
    /// are now held by at least `min_units` live placements (buffer included).
    pub async fn load_synchronized_item_ids(
        &self,
        buffer_unit_id: &str,
        min_units: i64,
        buffer_older_than: i64,
        limit: i64,
    ) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT iu.item_id AS item_id FROM item_unit iu
             JOIN item_unit b ON b.item_id = iu.item_id
             WHERE b.unit_id = ? AND b.to_delete = 0 AND b.last_modified <= ? AND iu.to_delete = 0
             GROUP BY iu.item_id
             HAVING COUNT(iu.unit_id) >= ?
             LIMIT ?",
        )
        .bind(buffer_unit_id)
        .bind(buffer_older_than)
        .bind(min_units)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| get_string(r, "item_id")).collect()
    }

    /// Completed live items with no placement at all on `unit_id`, oldest first.
    pub async fn load_item_ids_unknown_by_unit(&self, unit_id: &str, limit: i64) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT i.id AS id FROM item i
             WHERE i.status = 'Completed' AND i.to_delete = 0
               AND NOT EXISTS (SELECT 1 FROM item_unit iu WHERE iu.item_id = i.id AND iu.unit_id = ?)
             ORDER BY i.created
             LIMIT ?",
        )
        .bind(unit_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(|r| get_string(r, "id")).collect()
    }
}
