// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! WebDAV driver: one flat collection, objects addressed by locator.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::traits::{ObjectStore, StorageError};
use crate::config::WebdavConfig;

pub struct WebdavStore {
    client: reqwest::Client,
    /// Collection URL, always ending with `/`
    base: String,
    username: Option<String>,
    password: Option<String>,
}

fn http_err(e: reqwest::Error) -> StorageError {
    StorageError::Backend(format!("webdav: {}", e))
}

impl WebdavStore {
    /// Create the collection if needed and check we may write to it.
    pub async fn init(config: &WebdavConfig) -> Result<Self, StorageError> {
        let store = Self::new(config)?;
        let mkcol = Method::from_bytes(b"MKCOL").map_err(|e| StorageError::Backend(e.to_string()))?;
        let response = store.request(mkcol, &store.base).send().await.map_err(http_err)?;
        match response.status() {
            // 405: collection already exists
            s if s.is_success() || s == StatusCode::METHOD_NOT_ALLOWED => {
                debug!(base = %store.base, "WebDAV collection ready");
                Ok(store)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(StorageError::Forbidden(format!("webdav: access to {} denied", store.base)))
            }
            s => Err(StorageError::Backend(format!("webdav: MKCOL {} returned {}", store.base, s))),
        }
    }

    pub fn new(config: &WebdavConfig) -> Result<Self, StorageError> {
        if config.address.is_empty() {
            return Err(StorageError::InvalidData("webdav unit requires an address".into()));
        }
        let mut base = config.address.trim_end_matches('/').to_string();
        let path = config.path.trim_matches('/');
        if !path.is_empty() {
            base.push('/');
            base.push_str(path);
        }
        base.push('/');

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(http_err)?;
        Ok(Self {
            client,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.username {
            Some(user) => request.basic_auth(user, self.password.as_ref()),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for WebdavStore {
    fn driver(&self) -> &'static str {
        "webdav"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let response = self.request(Method::HEAD, &self.url(key)).send().await.map_err(http_err)?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Backend(format!("webdav: HEAD {} returned {}", key, s))),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        let response = self
            .request(Method::PUT, &self.url(key))
            .body(data)
            .send()
            .await
            .map_err(http_err)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StorageError::Backend(format!("webdav: PUT {} returned {}", key, response.status())))
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let response = self.request(Method::GET, &self.url(key)).send().await.map_err(http_err)?;
        match response.status() {
            s if s.is_success() => response.bytes().await.map_err(http_err),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound),
            s => Err(StorageError::Backend(format!("webdav: GET {} returned {}", key, s))),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let response = self.request(Method::DELETE, &self.url(key)).send().await.map_err(http_err)?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(StorageError::Backend(format!("webdav: DELETE {} returned {}", key, s))),
        }
    }
}
