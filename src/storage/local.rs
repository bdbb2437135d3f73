// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Filesystem driver. Also serves NFS units, which are mounted paths.
//!
//! Objects are sharded by the first two characters of their key:
//!
//! ```text
//! {root}/ab/abcdef0123…
//! ```
//!
//! Writes go to a temp file in the shard directory and are renamed into
//! place, so a reader never sees a partial object.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::traits::{ObjectStore, StorageError};

pub struct LocalStore {
    root: PathBuf,
    driver: &'static str,
}

fn io_err(e: std::io::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl LocalStore {
    /// Open (creating if needed) the root directory and check it is writable.
    pub async fn init(driver: &'static str, root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        if root.as_os_str().is_empty() {
            return Err(StorageError::InvalidData(format!("{} unit requires a path", driver)));
        }
        tokio::fs::create_dir_all(&root).await.map_err(io_err)?;

        let probe = root.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&probe, b"ok").await.map_err(|e| {
            StorageError::Backend(format!("{} is not writable: {}", root.display(), e))
        })?;
        tokio::fs::remove_file(&probe).await.map_err(io_err)?;

        debug!(driver, root = %root.display(), "Local object store ready");
        Ok(Self { root, driver })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::InvalidData(format!("invalid object key '{}'", key)));
        }
        let shard: String = key.chars().take(2).collect();
        Ok(self.root.join(shard).join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn driver(&self) -> &'static str {
        self.driver
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path).await.map_err(io_err)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;

        let tmp = dir.join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, &data).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(e));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(io_err(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(e)),
        }
    }
}
