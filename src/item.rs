// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item, ItemUnit and Unit records.
//!
//! An [`Item`] is the logical content unit (one log stream, one artifact). It is
//! identified by the hash of its [`ApiRef`] plus its [`ItemType`], and carries a
//! content [`ContentDigest`] once it reaches [`ItemStatus::Completed`].
//!
//! ```text
//! Incoming ──(terminal fragment | GC timeout)──► Completed ──► to_delete ──► purged
//!    │                                              │
//!    └─ digest = None                               └─ digest = Some(hash, md5, size), immutable
//! ```
//!
//! An [`ItemUnit`] is a placement record ("this item has a copy in that unit").

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use md5::Md5;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::storage::traits::StorageError;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════
// Item type / status
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    #[serde(rename = "step-log")]
    StepLog,
    #[serde(rename = "service-log")]
    ServiceLog,
    #[serde(rename = "run-result")]
    RunResult,
    #[serde(rename = "artifact")]
    Artifact,
    #[serde(rename = "worker-cache")]
    WorkerCache,
}

impl ItemType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepLog => "step-log",
            Self::ServiceLog => "service-log",
            Self::RunResult => "run-result",
            Self::Artifact => "artifact",
            Self::WorkerCache => "worker-cache",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "step-log" => Ok(Self::StepLog),
            "service-log" => Ok(Self::ServiceLog),
            "run-result" => Ok(Self::RunResult),
            "artifact" => Ok(Self::Artifact),
            "worker-cache" => Ok(Self::WorkerCache),
            other => Err(StorageError::InvalidData(format!("unknown item type '{}'", other))),
        }
    }

    /// Log items are line-oriented and eligible for the decoded-content cache.
    #[must_use]
    pub fn is_log(&self) -> bool {
        matches!(self, Self::StepLog | Self::ServiceLog)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Incoming,
    Completed,
}

impl ItemStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "Incoming",
            Self::Completed => "Completed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "Incoming" => Ok(Self::Incoming),
            "Completed" => Ok(Self::Completed),
            other => Err(StorageError::InvalidData(format!("unknown item status '{}'", other))),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// API references
// ═══════════════════════════════════════════════════════════════════════════

/// Origin of a log stream (step log or service log).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogApiRef {
    pub project_key: String,
    pub workflow_name: String,
    pub workflow_id: i64,
    pub run_id: i64,
    pub node_run_id: i64,
    pub node_run_name: String,
    pub node_run_job_id: i64,
    pub node_run_job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// Origin of a run result or artifact upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactApiRef {
    pub project_key: String,
    pub workflow_name: String,
    pub workflow_id: i64,
    pub run_id: i64,
    pub run_job_id: i64,
    pub run_job_name: String,
    pub run_node_id: i64,
    pub artifact_name: String,
    #[serde(default)]
    pub perm: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCacheApiRef {
    pub project_key: String,
    pub tag: String,
    pub name: String,
}

/// Structured origin descriptor. The variant is implied by the item type, so it is
/// serialized untagged and rebuilt with [`ApiRef::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ApiRef {
    Log(LogApiRef),
    Artifact(ArtifactApiRef),
    WorkerCache(WorkerCacheApiRef),
}

impl ApiRef {
    pub fn from_json(item_type: ItemType, json: &str) -> Result<Self, StorageError> {
        let parsed = match item_type {
            ItemType::StepLog | ItemType::ServiceLog => serde_json::from_str(json).map(Self::Log),
            ItemType::RunResult | ItemType::Artifact => serde_json::from_str(json).map(Self::Artifact),
            ItemType::WorkerCache => serde_json::from_str(json).map(Self::WorkerCache),
        };
        parsed.map_err(|e| StorageError::InvalidData(format!("bad api ref for {}: {}", item_type, e)))
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|e| StorageError::InvalidData(e.to_string()))
    }

    /// Stable lookup hash: hex SHA-256 of the canonical JSON form.
    ///
    /// Struct field order is fixed, so the JSON form is canonical without sorting.
    pub fn hash(&self) -> Result<String, StorageError> {
        let json = self.to_json()?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }

    /// Run identifier, used by run-level deletion.
    #[must_use]
    pub fn run_id(&self) -> Option<i64> {
        match self {
            Self::Log(r) => Some(r.run_id),
            Self::Artifact(r) => Some(r.run_id),
            Self::WorkerCache(_) => None,
        }
    }

    /// Human-friendly download filename.
    #[must_use]
    pub fn to_filename(&self) -> String {
        match self {
            Self::Log(r) => {
                let suffix = match (&r.step_name, &r.service_name) {
                    (Some(step), _) => format!("{}-{}", r.step_order.unwrap_or(0), step),
                    (None, Some(service)) => format!("service-{}", service),
                    (None, None) => "log".to_string(),
                };
                sanitize_filename(&format!(
                    "{}-{}-{}-{}-{}.log",
                    r.project_key, r.workflow_name, r.run_id, r.node_run_job_name, suffix
                ))
            }
            Self::Artifact(r) => sanitize_filename(&r.artifact_name),
            Self::WorkerCache(r) => sanitize_filename(&format!("{}-{}.tar", r.name, r.tag)),
        }
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Content digest
// ═══════════════════════════════════════════════════════════════════════════

/// Canonical content hash computed at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDigest {
    /// Hex SHA-512 of the content; the input of convergent addressing.
    pub hash: String,
    pub md5: String,
    pub size: i64,
}

impl ContentDigest {
    #[must_use]
    pub fn compute(content: &[u8]) -> Self {
        Self {
            hash: hex::encode(Sha512::digest(content)),
            md5: hex::encode(Md5::digest(content)),
            size: content.len() as i64,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub created: i64,
    pub last_modified: i64,
    pub api_ref: ApiRef,
    pub api_ref_hash: String,
    pub item_type: ItemType,
    pub status: ItemStatus,
    pub to_delete: bool,
    /// Set iff `status == Completed`.
    pub digest: Option<ContentDigest>,
}

impl Item {
    /// A fresh Incoming item for the given origin.
    pub fn new_incoming(api_ref: ApiRef, item_type: ItemType) -> Result<Self, StorageError> {
        let now = now_millis();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: now,
            last_modified: now,
            api_ref_hash: api_ref.hash()?,
            api_ref,
            item_type,
            status: ItemStatus::Incoming,
            to_delete: false,
            digest: None,
        })
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ItemStatus::Completed
    }

    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        self.digest.as_ref().map(|d| d.hash.as_str())
    }

    #[must_use]
    pub fn size(&self) -> i64 {
        self.digest.as_ref().map_or(0, |d| d.size)
    }
}

/// Placement of an item in one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUnit {
    pub id: String,
    pub item_id: String,
    pub unit_id: String,
    /// Backend key. Item id for the buffer, convergent locator for storage units.
    pub locator: String,
    pub last_modified: i64,
    pub item_type: ItemType,
    pub to_delete: bool,
}

impl ItemUnit {
    #[must_use]
    pub fn new(item: &Item, unit_id: &str, locator: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            unit_id: unit_id.to_string(),
            locator,
            last_modified: now_millis(),
            item_type: item.item_type,
            to_delete: false,
        }
    }
}

/// Persisted identity of one configured backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub id: String,
    pub name: String,
    pub created: i64,
    /// Driver config with secrets redacted.
    pub config: String,
}

impl UnitRecord {
    #[must_use]
    pub fn new(name: &str, config: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created: now_millis(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_ref(run_id: i64, step: &str) -> ApiRef {
        ApiRef::Log(LogApiRef {
            project_key: "PROJ".into(),
            workflow_name: "build".into(),
            workflow_id: 1,
            run_id,
            node_run_id: 10,
            node_run_name: "pipeline".into(),
            node_run_job_id: 100,
            node_run_job_name: "compile".into(),
            step_order: Some(0),
            step_name: Some(step.into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_api_ref_hash_is_stable() {
        let a = step_ref(1, "checkout").hash().unwrap();
        let b = step_ref(1, "checkout").hash().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_api_ref_hash_differs_by_field() {
        assert_ne!(
            step_ref(1, "checkout").hash().unwrap(),
            step_ref(2, "checkout").hash().unwrap()
        );
    }

    #[test]
    fn test_api_ref_json_roundtrip_by_type() {
        let r = step_ref(3, "test");
        let json = r.to_json().unwrap();
        assert_eq!(ApiRef::from_json(ItemType::StepLog, &json).unwrap(), r);
        assert!(ApiRef::from_json(ItemType::WorkerCache, &json).is_err());
    }

    #[test]
    fn test_new_item_is_incoming_without_digest() {
        let item = Item::new_incoming(step_ref(1, "a"), ItemType::StepLog).unwrap();
        assert_eq!(item.status, ItemStatus::Incoming);
        assert!(item.digest.is_none());
        assert_eq!(item.size(), 0);
    }

    #[test]
    fn test_content_digest() {
        let d = ContentDigest::compute(b"hello\n");
        assert_eq!(d.size, 6);
        assert_eq!(d.hash.len(), 128);
        assert_eq!(d.md5, "b1946ac92492d2347c6235b4d2611184");
    }

    #[test]
    fn test_item_type_parse() {
        for t in [ItemType::StepLog, ItemType::ServiceLog, ItemType::RunResult, ItemType::Artifact, ItemType::WorkerCache] {
            assert_eq!(ItemType::parse(t.as_str()).unwrap(), t);
        }
        assert!(ItemType::parse("nope").is_err());
        assert!(ItemType::StepLog.is_log());
        assert!(!ItemType::Artifact.is_log());
    }

    #[test]
    fn test_filename_is_sanitized() {
        let name = step_ref(7, "my step/1").to_filename();
        assert!(!name.contains('/'));
        assert!(!name.contains(' '));
        assert!(name.ends_with(".log"));
    }
}
