// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Log ingestion pipeline.
//!
//! ```text
//!  producer ──TCP──► LogServer ── NullFrameCodec ── global byte limiter
//!                        │                          per-connection line limiter
//!                        ▼
//!                   LogHandler ── Authenticator (JWS, key caches)
//!                        │        size cap / truncation
//!                        ▼
//!        KV: cdn:log:job:{key} (list) + cdn:log:job:waiting (zset)
//!                        │
//!                        ▼
//!                  LogDrainer ── heartbeat lease per job
//!                        │
//!                        ▼
//!                   LogStore ── buffer add ── completion ── sync trigger
//! ```

pub mod auth;
pub mod codec;
pub mod dequeue;
pub mod handler;
pub mod jws;
pub mod message;
pub mod ratelimit;
pub mod server;
pub mod store;

use thiserror::Error;

use crate::storage::traits::StorageError;

pub use auth::{Authenticator, HttpAuthority, IdentityAuthority, StaticAuthority};
pub use codec::NullFrameCodec;
pub use dequeue::LogDrainer;
pub use handler::{LogHandler, QueueOutcome, QueuedLine};
pub use message::{LogMessage, Signature};
pub use ratelimit::RateLimiter;
pub use server::LogServer;
pub use store::{LogStore, StoreOutcome};

/// Ordered set of job keys with queued lines.
pub const WAITING_JOBS_KEY: &str = "cdn:log:job:waiting";

/// Content substituted for the terminal fragment once a job exceeded its size cap.
pub const TRUNCATION_MARKER: &str = "...truncated\n";

#[must_use]
pub fn job_queue_key(job_key: &str) -> String {
    format!("cdn:log:job:{}", job_key)
}

#[must_use]
pub fn heartbeat_key(job_key: &str) -> String {
    format!("cdn:log:job:heartbeat:{}", job_key)
}

#[must_use]
pub fn size_key(job_key: &str) -> String {
    format!("cdn:log:size:{}", job_key)
}

/// Line number of the terminal fragment of an item still waiting for earlier lines.
#[must_use]
pub fn terminated_key(item_id: &str) -> String {
    format!("cdn:log:terminated:{}", item_id)
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("message carries no signature")]
    MissingSignature,

    #[error("malformed token: {0}")]
    Token(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Rejected at the boundary: bad or mismatched signature.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::MissingSignature
                | Self::Token(_)
                | Self::Storage(StorageError::Unauthorized(_))
                | Self::Storage(StorageError::Forbidden(_))
        )
    }
}
