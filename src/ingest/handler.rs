// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Frame handling: authenticate, apply the per-job size cap, enqueue.
//!
//! ```text
//! size = GET cdn:log:size:{job}
//! size <  cap                → enqueue as is
//! size >= cap, not terminal  → drop
//! size >= cap, terminal      → enqueue "...truncated" at WARN instead
//! terminal  → DEL size key
//! otherwise → INCRBY size key (24h TTL)
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::auth::{AuthenticatedClaim, Authenticator};
use super::message::{build_line, LogMessage, Signature, LEVEL_WARNING};
use super::{job_queue_key, size_key, IngestError, TRUNCATION_MARKER, WAITING_JOBS_KEY};
use crate::config::LogConfig;
use crate::item::{now_millis, ItemType};
use crate::kv::KvStore;
use crate::metrics;

/// One fragment waiting in a job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedLine {
    pub signature: Signature,
    pub item_type: ItemType,
    pub line: u64,
    /// Rendered `[LEVEL] text\n`.
    pub content: String,
    pub terminated: bool,
    /// The job hit its size cap and this fragment carries the truncation marker.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    /// Job over its size cap, fragment discarded.
    Dropped,
    /// Terminal fragment replaced by the truncation marker.
    Truncated,
}

pub struct LogHandler {
    kv: Arc<dyn KvStore>,
    authenticator: Arc<Authenticator>,
    step_max_size: i64,
    size_key_ttl: Duration,
}

impl LogHandler {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, authenticator: Arc<Authenticator>, config: &LogConfig) -> Self {
        Self {
            kv,
            authenticator,
            step_max_size: config.step_max_size,
            size_key_ttl: Duration::from_secs(config.size_key_ttl_secs),
        }
    }

    pub async fn handle_frame(&self, frame: &[u8]) -> Result<QueueOutcome, IngestError> {
        let msg: LogMessage = serde_json::from_slice(frame).map_err(|e| IngestError::Decode(e.to_string()))?;
        self.handle_message(&msg).await
    }

    pub async fn handle_message(&self, msg: &LogMessage) -> Result<QueueOutcome, IngestError> {
        let token = msg.signature().ok_or(IngestError::MissingSignature)?;
        let claim = match self.authenticator.authenticate(token).await {
            Ok(claim) => claim,
            Err(e) => {
                metrics::record_log_message("unknown", "rejected");
                return Err(e);
            }
        };
        self.enqueue(&claim, msg).await
    }

    /// Queue an authenticated fragment on its job.
    pub async fn enqueue(&self, claim: &AuthenticatedClaim, msg: &LogMessage) -> Result<QueueOutcome, IngestError> {
        let size_key = size_key(&claim.job_key);
        let current: i64 = self
            .kv
            .get(&size_key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let terminated = msg.terminated();

        let (content, outcome) = if current >= self.step_max_size {
            if !terminated {
                debug!(job = %claim.job_key, size = current, "Job over size cap, dropping fragment");
                metrics::record_log_message(claim.source(), "dropped");
                return Ok(QueueOutcome::Dropped);
            }
            warn!(job = %claim.job_key, size = current, cap = self.step_max_size, "Job log truncated");
            (build_line(LEVEL_WARNING, TRUNCATION_MARKER), QueueOutcome::Truncated)
        } else {
            (build_line(msg.level, msg.text()), QueueOutcome::Queued)
        };

        let queued = QueuedLine {
            signature: claim.signature.clone(),
            item_type: claim.item_type,
            line: msg.line(),
            content,
            terminated,
            truncated: outcome == QueueOutcome::Truncated,
        };
        let payload = serde_json::to_string(&queued).map_err(|e| IngestError::Decode(e.to_string()))?;
        self.kv.push(&job_queue_key(&claim.job_key), &payload).await?;
        self.kv.zadd(WAITING_JOBS_KEY, now_millis() as f64, &claim.job_key).await?;

        if terminated {
            self.kv.delete(&size_key).await?;
        } else {
            self.kv
                .incr_by(&size_key, queued.content.len() as i64, Some(self.size_key_ttl))
                .await?;
        }

        let status = match outcome {
            QueueOutcome::Truncated => "truncated",
            _ => "accepted",
        };
        metrics::record_log_message(claim.source(), status);
        Ok(outcome)
    }
}
