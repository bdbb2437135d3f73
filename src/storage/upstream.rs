// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only driver fetching content from an upstream API that still holds
//! logs and artifacts ingested before the CDN existed.
//!
//! The object key is the item's origin hash; the upstream serves
//! `GET {host}/cdn/item/{key}/download`. Writes and deletes are refused.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::traits::{ObjectStore, StorageError};
use crate::config::UpstreamConfig;

pub struct UpstreamStore {
    client: reqwest::Client,
    host: String,
    token: Option<String>,
}

fn http_err(e: reqwest::Error) -> StorageError {
    StorageError::Backend(format!("upstream: {}", e))
}

impl UpstreamStore {
    /// Check the upstream answers before accepting the unit.
    pub async fn init(config: &UpstreamConfig) -> Result<Self, StorageError> {
        let store = Self::new(config)?;
        let url = format!("{}/mon/version", store.host);
        let response = store.authorized(store.client.get(&url)).send().await.map_err(http_err)?;
        if !response.status().is_success() {
            return Err(StorageError::Backend(format!("upstream: {} returned {}", url, response.status())));
        }
        debug!(host = %store.host, "Upstream reachable");
        Ok(store)
    }

    pub fn new(config: &UpstreamConfig) -> Result<Self, StorageError> {
        if config.host.is_empty() {
            return Err(StorageError::InvalidData("upstream unit requires a host".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(http_err)?;
        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/cdn/item/{}/download", self.host, key)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn refuse(operation: &str) -> StorageError {
        StorageError::Unsupported { unit: "upstream".into(), operation: operation.into() }
    }
}

#[async_trait]
impl ObjectStore for UpstreamStore {
    fn driver(&self) -> &'static str {
        "upstream"
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let response = self.authorized(self.client.head(self.url(key))).send().await.map_err(http_err)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Backend(format!("upstream: HEAD {} returned {}", key, s))),
        }
    }

    async fn put(&self, _key: &str, _data: Bytes) -> Result<(), StorageError> {
        Err(Self::refuse("write"))
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let response = self.authorized(self.client.get(self.url(key))).send().await.map_err(http_err)?;
        match response.status() {
            s if s.is_success() => response.bytes().await.map_err(http_err),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound),
            StatusCode::UNAUTHORIZED => Err(StorageError::Unauthorized(format!("upstream: {}", key))),
            StatusCode::FORBIDDEN => Err(StorageError::Forbidden(format!("upstream: {}", key))),
            s => Err(StorageError::Backend(format!("upstream: GET {} returned {}", key, s))),
        }
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(Self::refuse("delete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> UpstreamStore {
        UpstreamStore::new(&UpstreamConfig { host: "http://api.local/".into(), token: None }).unwrap()
    }

    #[test]
    fn test_download_url() {
        assert_eq!(store().url("deadbeef"), "http://api.local/cdn/item/deadbeef/download");
    }

    #[tokio::test]
    async fn test_writes_are_refused() {
        let s = store();
        assert!(s.is_read_only());
        assert!(matches!(s.put("k", Bytes::new()).await, Err(StorageError::Unsupported { .. })));
        assert!(matches!(s.delete("k").await, Err(StorageError::Unsupported { .. })));
    }
}
