//! Unit rows.

use super::{db_err, is_unique_violation, unit_from_row, Catalog};
use crate::item::UnitRecord;
use crate::storage::traits::StorageError;

impl Catalog {
    pub async fn load_unit_by_name(&self, name: &str) -> Result<Option<UnitRecord>, StorageError> {
        let row = sqlx::query("SELECT id, name, created, config FROM unit WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(unit_from_row).transpose()
    }

    pub async fn load_all_units(&self) -> Result<Vec<UnitRecord>, StorageError> {
        let rows = sqlx::query("SELECT id, name, created, config FROM unit ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(unit_from_row).collect()
    }

    pub async fn insert_unit(&self, unit: &UnitRecord) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO unit (id, name, created, config) VALUES (?, ?, ?, ?)")
            .bind(&unit.id)
            .bind(&unit.name)
            .bind(unit.created)
            .bind(&unit.config)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::Conflict(format!("unit {} already exists", unit.name))
                } else {
                    db_err(e)
                }
            })?;
        Ok(())
    }

    /// Registered record for a configured unit, created on first start.
    pub async fn load_or_create_unit(&self, name: &str, config: String) -> Result<UnitRecord, StorageError> {
        if let Some(existing) = self.load_unit_by_name(name).await? {
            return Ok(existing);
        }
        let record = UnitRecord::new(name, config);
        match self.insert_unit(&record).await {
            Ok(()) => Ok(record),
            Err(StorageError::Conflict(_)) => self
                .load_unit_by_name(name)
                .await?
                .ok_or_else(|| StorageError::Conflict(format!("unit {} vanished after conflict", name))),
            Err(e) => Err(e),
        }
    }

    /// Remove a unit together with all of its placement records.
    pub async fn delete_unit(&self, unit_id: &str) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let placements = sqlx::query("DELETE FROM item_unit WHERE unit_id = ?")
            .bind(unit_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();
        sqlx::query("DELETE FROM unit WHERE id = ?")
            .bind(unit_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(placements)
    }
}
