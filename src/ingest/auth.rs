// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Signature verification for ingested frames.
//!
//! ```text
//! token ── unsafe_parse ──► claimed principal
//!                               │
//!            ┌──────────────────┴───────────────────┐
//!         worker                                  service
//!   worker cache / authority                hatchery key cache
//!   verify HS512 (session key)              (refresh all on miss)
//!   job + worker id must match              verify EdDSA
//!                                           worker must belong to hatchery
//! ```
//!
//! Keys come from an [`IdentityAuthority`] and are held in explicit TTL caches
//! owned by the [`Authenticator`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::jws;
use super::message::Signature;
use super::IngestError;
use crate::config::IdentityConfig;
use crate::item::ItemType;
use crate::storage::traits::StorageError;

// ═══════════════════════════════════════════════════════════════════════════
// Identity records
// ═══════════════════════════════════════════════════════════════════════════

fn base64_bytes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(d)?;
    STANDARD.decode(s).map_err(serde::de::Error::custom)
}

#[derive(Clone, Deserialize)]
pub struct WorkerIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub job_run_id: Option<i64>,
    #[serde(default)]
    pub hatchery_id: Option<i64>,
    /// HS512 session key.
    #[serde(rename = "private_key", deserialize_with = "base64_bytes")]
    pub key: Vec<u8>,
}

impl std::fmt::Debug for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerIdentity")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("job_run_id", &self.job_run_id)
            .field("hatchery_id", &self.hatchery_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HatcheryKey {
    pub id: i64,
    pub name: String,
    pub key: VerifyingKey,
}

#[derive(Deserialize)]
struct HatcheryRecord {
    id: i64,
    name: String,
    #[serde(deserialize_with = "base64_bytes")]
    public_key: Vec<u8>,
}

impl TryFrom<HatcheryRecord> for HatcheryKey {
    type Error = StorageError;

    fn try_from(r: HatcheryRecord) -> Result<Self, Self::Error> {
        let bytes: [u8; 32] = r
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::InvalidData(format!("hatchery {} public key is not 32 bytes", r.name)))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| StorageError::InvalidData(format!("hatchery {} public key: {}", r.name, e)))?;
        Ok(Self { id: r.id, name: r.name, key })
    }
}

/// Source of principal keys.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Worker with its session key, `None` if unknown.
    async fn worker(&self, name: &str) -> Result<Option<WorkerIdentity>, StorageError>;

    /// Every hatchery's public key.
    async fn hatchery_keys(&self) -> Result<Vec<HatcheryKey>, StorageError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Authorities
// ═══════════════════════════════════════════════════════════════════════════

/// In-memory authority for tests and single-node setups.
#[derive(Default)]
pub struct StaticAuthority {
    workers: DashMap<String, WorkerIdentity>,
    hatcheries: DashMap<i64, HatcheryKey>,
}

impl StaticAuthority {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&self, worker: WorkerIdentity) {
        self.workers.insert(worker.name.clone(), worker);
    }

    pub fn remove_worker(&self, name: &str) {
        self.workers.remove(name);
    }

    pub fn add_hatchery(&self, hatchery: HatcheryKey) {
        self.hatcheries.insert(hatchery.id, hatchery);
    }
}

#[async_trait]
impl IdentityAuthority for StaticAuthority {
    async fn worker(&self, name: &str) -> Result<Option<WorkerIdentity>, StorageError> {
        Ok(self.workers.get(name).map(|w| w.clone()))
    }

    async fn hatchery_keys(&self) -> Result<Vec<HatcheryKey>, StorageError> {
        Ok(self.hatcheries.iter().map(|h| h.value().clone()).collect())
    }
}

/// Authority backed by the platform API.
pub struct HttpAuthority {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpAuthority {
    pub fn new(config: &IdentityConfig) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let base = config
            .api_url
            .as_deref()
            .ok_or_else(|| StorageError::InvalidData("identity.api_url is not set".into()))?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, StorageError> {
        let mut req = self.client.get(format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl IdentityAuthority for HttpAuthority {
    async fn worker(&self, name: &str) -> Result<Option<WorkerIdentity>, StorageError> {
        let resp = self.get(&format!("/worker/{}?withKey=true", name)).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| StorageError::Backend(e.to_string()))?;
        resp.json::<WorkerIdentity>()
            .await
            .map(Some)
            .map_err(|e| StorageError::InvalidData(format!("worker {}: {}", name, e)))
    }

    async fn hatchery_keys(&self) -> Result<Vec<HatcheryKey>, StorageError> {
        let resp = self
            .get("/services?type=hatchery&withKey=true")
            .await?
            .error_for_status()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let records: Vec<HatcheryRecord> = resp
            .json()
            .await
            .map_err(|e| StorageError::InvalidData(format!("hatcheries: {}", e)))?;
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let name = record.name.clone();
            match HatcheryKey::try_from(record) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(hatchery = %name, error = %e, "Skipping hatchery with unusable key"),
            }
        }
        Ok(keys)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Caches
// ═══════════════════════════════════════════════════════════════════════════

/// Entries expire `ttl` after insertion and are dropped lazily on lookup.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, (Instant, V)>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: DashMap::new() }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hit = self.entries.get(key).and_then(|e| {
            let (at, value) = e.value();
            (at.elapsed() < self.ttl).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Authenticator
// ═══════════════════════════════════════════════════════════════════════════

/// Verified origin of one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClaim {
    pub signature: Signature,
    pub item_type: ItemType,
    pub job_key: String,
}

impl AuthenticatedClaim {
    #[must_use]
    pub fn source(&self) -> &'static str {
        match self.item_type {
            ItemType::ServiceLog => "service",
            _ => "worker",
        }
    }
}

pub struct Authenticator {
    authority: Arc<dyn IdentityAuthority>,
    workers: TtlCache<String, WorkerIdentity>,
    hatcheries: TtlCache<i64, HatcheryKey>,
}

impl Authenticator {
    #[must_use]
    pub fn new(authority: Arc<dyn IdentityAuthority>, key_cache_ttl: Duration) -> Self {
        Self {
            authority,
            workers: TtlCache::new(key_cache_ttl),
            hatcheries: TtlCache::new(key_cache_ttl),
        }
    }

    /// Verify a frame's token and bind it to a queue.
    pub async fn authenticate(&self, token: &str) -> Result<AuthenticatedClaim, IngestError> {
        let claimed: Signature = jws::unsafe_parse(token)?;
        let signature = match (&claimed.worker, &claimed.service) {
            (Some(worker), _) => self.verify_worker(token, &worker.worker_name).await?,
            (None, Some(service)) => self.verify_service(token, service.hatchery_id, &service.worker_name).await?,
            (None, None) => {
                return Err(StorageError::Forbidden("signature names neither a worker nor a service".into()).into())
            }
        };
        Ok(AuthenticatedClaim {
            item_type: signature.item_type()?,
            job_key: signature.job_key(),
            signature,
        })
    }

    async fn verify_worker(&self, token: &str, worker_name: &str) -> Result<Signature, IngestError> {
        let worker = self
            .worker(worker_name)
            .await?
            .ok_or_else(|| StorageError::Forbidden(format!("unknown worker {}", worker_name)))?;

        let signature: Signature = jws::verify_hs512(token, &worker.key)?;
        if worker.job_run_id != Some(signature.job_id) {
            return Err(StorageError::Forbidden(format!(
                "worker {} is not running job {}",
                worker.name, signature.job_id
            ))
            .into());
        }
        match &signature.worker {
            Some(claim) if claim.worker_id == worker.id => Ok(signature),
            _ => Err(StorageError::Forbidden(format!("worker id mismatch for {}", worker.name)).into()),
        }
    }

    async fn verify_service(&self, token: &str, hatchery_id: i64, worker_name: &str) -> Result<Signature, IngestError> {
        let hatchery = self
            .hatchery(hatchery_id)
            .await?
            .ok_or_else(|| StorageError::Forbidden(format!("unknown hatchery {}", hatchery_id)))?;

        let signature: Signature = jws::verify_eddsa(token, &hatchery.key)?;
        let worker = self
            .worker(worker_name)
            .await?
            .ok_or_else(|| StorageError::Forbidden(format!("unknown worker {}", worker_name)))?;
        if worker.hatchery_id != Some(hatchery.id) {
            return Err(StorageError::Forbidden(format!(
                "worker {} was not spawned by hatchery {}",
                worker.name, hatchery.name
            ))
            .into());
        }
        Ok(signature)
    }

    async fn worker(&self, name: &str) -> Result<Option<WorkerIdentity>, StorageError> {
        if let Some(worker) = self.workers.get(&name.to_string()) {
            return Ok(Some(worker));
        }
        let worker = self.authority.worker(name).await?;
        if let Some(w) = &worker {
            debug!(worker = %name, "Worker key cached");
            self.workers.insert(name.to_string(), w.clone());
        }
        Ok(worker)
    }

    /// On a miss, every hatchery key is reloaded: new hatcheries appear rarely and together.
    async fn hatchery(&self, id: i64) -> Result<Option<HatcheryKey>, StorageError> {
        if let Some(key) = self.hatcheries.get(&id) {
            return Ok(Some(key));
        }
        let keys = self.authority.hatchery_keys().await?;
        info!(count = keys.len(), "Hatchery keys refreshed");
        let mut found = None;
        for key in keys {
            if key.id == id {
                found = Some(key.clone());
            }
            self.hatcheries.insert(key.id, key);
        }
        Ok(found)
    }

    /// Drop a worker's cached key (worker disabled or key rotated).
    pub fn forget_worker(&self, name: &str) {
        self.workers.invalidate(&name.to_string());
    }
}
