// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Non-blocking advisory leases ("lock or skip").
//!
//! A lease row is `(resource, holder, expires_at)`. Taking a lease first drops
//! an expired row for the resource, then inserts; losing the insert race to the
//! primary key means somebody else holds it and the caller gets
//! [`StorageError::Locked`] immediately. Expiry bounds how long a crashed holder
//! can keep an item busy.

use std::time::Duration;

use super::{db_err, is_unique_violation, Catalog};
use crate::item::now_millis;
use crate::storage::traits::StorageError;

/// Lease resource for an item row.
#[must_use]
pub fn item_lock_key(item_id: &str) -> String {
    format!("item:{}", item_id)
}

impl Catalog {
    pub async fn try_lock(&self, resource: &str, holder: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = now_millis();
        sqlx::query("DELETE FROM lease WHERE resource = ? AND expires_at < ?")
            .bind(resource)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        sqlx::query("INSERT INTO lease (resource, holder, expires_at) VALUES (?, ?, ?)")
            .bind(resource)
            .bind(holder)
            .bind(now + ttl.as_millis() as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::Locked(resource.to_string())
                } else {
                    db_err(e)
                }
            })?;
        Ok(())
    }

    /// Release a lease. Only the holder can release it; releasing twice is harmless.
    pub async fn unlock(&self, resource: &str, holder: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM lease WHERE resource = ? AND holder = ?")
            .bind(resource)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
