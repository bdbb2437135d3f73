// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire envelope and signed origin claim.
//!
//! Frames are GELF-style JSON objects. Extension fields are prefixed with `_`:
//!
//! | field         | meaning                                   |
//! |---------------|-------------------------------------------|
//! | `_Signature`  | compact JWS carrying a [`Signature`]      |
//! | `_Terminated` | last fragment of the stream               |
//! | `_Line`       | producer line counter                     |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::item::{ItemType, LogApiRef};
use crate::storage::traits::StorageError;

pub const EXTRA_SIGNATURE: &str = "_Signature";
pub const EXTRA_TERMINATED: &str = "_Terminated";
pub const EXTRA_LINE: &str = "_Line";

/// Syslog level used for the truncation marker.
pub const LEVEL_WARNING: i32 = 4;

/// Syslog severity names, indexed by level.
const LEVELS: [&str; 8] = ["EMERGENCY", "ALERT", "CRITICAL", "ERROR", "WARN", "NOTICE", "INFO", "DEBUG"];

#[must_use]
pub fn level_name(level: i32) -> &'static str {
    usize::try_from(level).ok().and_then(|i| LEVELS.get(i)).copied().unwrap_or("")
}

/// Stored line: `[LEVEL] text`, always newline-terminated.
#[must_use]
pub fn build_line(level: i32, text: &str) -> String {
    let mut line = format!("[{}] {}", level_name(level), text);
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub short_message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub full_message: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub level: i32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LogMessage {
    /// A message with the three extension fields set.
    #[must_use]
    pub fn new(text: &str, level: i32, signature: &str, line: u64, terminated: bool) -> Self {
        let mut extra = Map::new();
        extra.insert(EXTRA_SIGNATURE.into(), Value::String(signature.to_string()));
        extra.insert(EXTRA_LINE.into(), Value::from(line));
        extra.insert(EXTRA_TERMINATED.into(), Value::Bool(terminated));
        Self {
            version: "1.1".into(),
            short_message: text.to_string(),
            full_message: text.to_string(),
            level,
            extra,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.extra.get(EXTRA_SIGNATURE).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Producers send booleans, some older ones 0/1 or strings.
    #[must_use]
    pub fn terminated(&self) -> bool {
        match self.extra.get(EXTRA_TERMINATED) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
            _ => false,
        }
    }

    #[must_use]
    pub fn line(&self) -> u64 {
        match self.extra.get(EXTRA_LINE) {
            Some(Value::Number(n)) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)).unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        if self.full_message.is_empty() {
            &self.short_message
        } else {
            &self.full_message
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Signed origin claim
// ═══════════════════════════════════════════════════════════════════════════

/// Present when a worker signs its own step logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerClaim {
    pub worker_id: String,
    pub worker_name: String,
    pub step_name: String,
    pub step_order: i64,
}

/// Present when a hatchery signs the logs of a job's service container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaim {
    pub hatchery_id: i64,
    pub hatchery_name: String,
    pub requirement_id: i64,
    pub requirement_name: String,
    pub worker_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub project_key: String,
    pub workflow_name: String,
    pub workflow_id: i64,
    pub run_id: i64,
    pub node_run_id: i64,
    pub node_run_name: String,
    pub job_id: i64,
    pub job_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceClaim>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Signature {
    pub fn item_type(&self) -> Result<ItemType, StorageError> {
        match (&self.worker, &self.service) {
            (Some(_), _) => Ok(ItemType::StepLog),
            (None, Some(_)) => Ok(ItemType::ServiceLog),
            (None, None) => Err(StorageError::Forbidden("signature names neither a worker nor a service".into())),
        }
    }

    /// Partition key for the ingestion queues.
    ///
    /// Step logs of one job share a key; each service of the job gets its own.
    #[must_use]
    pub fn job_key(&self) -> String {
        match (&self.worker, &self.service) {
            (None, Some(service)) => format!("{}-{}", self.job_id, service.requirement_id),
            _ => self.job_id.to_string(),
        }
    }

    #[must_use]
    pub fn log_api_ref(&self) -> LogApiRef {
        let mut api_ref = LogApiRef {
            project_key: self.project_key.clone(),
            workflow_name: self.workflow_name.clone(),
            workflow_id: self.workflow_id,
            run_id: self.run_id,
            node_run_id: self.node_run_id,
            node_run_name: self.node_run_name.clone(),
            node_run_job_id: self.job_id,
            node_run_job_name: self.job_name.clone(),
            ..Default::default()
        };
        if let Some(worker) = &self.worker {
            api_ref.step_order = Some(worker.step_order);
            api_ref.step_name = Some(worker.step_name.clone());
        } else if let Some(service) = &self.service {
            api_ref.service_id = Some(service.requirement_id);
            api_ref.service_name = Some(service.requirement_name.clone());
        }
        api_ref
    }
}
