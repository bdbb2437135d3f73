// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! CDN engine coordinator.
//!
//! The [`CdnEngine`] ties together all components:
//! - SQL catalog of items, placements, units and leases
//! - KV service (Redis, or in-process) holding the buffer, job queues and leases
//! - Log ingestion: TCP server, authentication, size cap, queue drainers
//! - Sync engine promoting completed items into every storage unit
//! - Garbage collection and the decoded-log LRU cache
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use cdn_engine::{CdnConfig, CdnEngine, EngineState};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = CdnConfig::default();
//! let mut engine = CdnEngine::new(config);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("Start failed");
//! let engine = Arc::new(engine);
//! let runner = tokio::spawn({
//!     let engine = Arc::clone(&engine);
//!     async move { engine.run().await }
//! });
//!
//! // ... serve producers and readers ...
//!
//! engine.shutdown().await;
//! runner.await.unwrap().unwrap();
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{EngineState, ResyncReport, UnitInfo};

use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};

use crate::catalog::Catalog;
use crate::completion::Completer;
use crate::config::CdnConfig;
use crate::events::{EventBus, ItemEvent};
use crate::eviction::LogCache;
use crate::gc::GarbageCollector;
use crate::ingest::{Authenticator, IdentityAuthority, LogDrainer, LogHandler, LogServer, LogStore};
use crate::kv::KvStore;
use crate::storage::traits::StorageError;
use crate::storage::RunningUnits;
use crate::sync::SyncEngine;

/// Everything built by [`CdnEngine::start`].
pub(super) struct Components {
    pub(super) catalog: Arc<Catalog>,
    pub(super) kv: Arc<dyn KvStore>,
    pub(super) units: Arc<RunningUnits>,
    pub(super) completer: Arc<Completer>,
    pub(super) cache: Arc<LogCache>,
    pub(super) authenticator: Arc<Authenticator>,
    pub(super) handler: Arc<LogHandler>,
    pub(super) store: Arc<LogStore>,
    pub(super) drainer: Arc<LogDrainer>,
    pub(super) server: Arc<LogServer>,
    pub(super) sync: Arc<SyncEngine>,
    pub(super) gc: Arc<GarbageCollector>,
}

/// Main CDN engine coordinator.
///
/// # Thread Safety
///
/// After [`start()`](Self::start) the engine is meant to be shared behind an
/// `Arc`: [`run()`](Self::run), the read path and the admin operations all
/// take `&self`.
pub struct CdnEngine {
    pub(super) config: CdnConfig,

    /// Lease holder identity of this process
    pub(super) holder: String,

    /// Identity authority override (tests, embedding)
    pub(super) authority: Option<Arc<dyn IdentityAuthority>>,

    /// KV service override (tests, embedding)
    pub(super) kv_override: Option<Arc<dyn KvStore>>,

    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Flipped to `true` once to stop every background task
    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) events: EventBus,

    /// Woken on item completion to start a sync pass early
    pub(super) sync_trigger: Arc<Notify>,

    pub(super) components: Option<Components>,
}

impl CdnEngine {
    /// Create a new engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to connect to backends and transition to `Ready`.
    #[must_use]
    pub fn new(config: CdnConfig) -> Self {
        let (state, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            holder: format!("cdn-{}", uuid::Uuid::new_v4()),
            authority: None,
            kv_override: None,
            state,
            state_rx,
            shutdown_tx,
            events: EventBus::default(),
            sync_trigger: Arc::new(Notify::new()),
            components: None,
        }
    }

    /// Use this identity authority instead of the one derived from `[identity]`.
    #[must_use]
    pub fn with_authority(mut self, authority: Arc<dyn IdentityAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Use this KV service instead of the one derived from `redis_url`.
    #[must_use]
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv_override = Some(kv);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CdnConfig {
        &self.config
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Live-tail feed: buffered content and completions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.events.subscribe()
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    pub(super) fn components(&self) -> Result<&Components, StorageError> {
        self.components
            .as_ref()
            .ok_or_else(|| StorageError::Backend("engine not started".into()))
    }

    pub fn catalog(&self) -> Result<&Arc<Catalog>, StorageError> {
        Ok(&self.components()?.catalog)
    }

    pub fn kv(&self) -> Result<&Arc<dyn KvStore>, StorageError> {
        Ok(&self.components()?.kv)
    }

    pub fn units(&self) -> Result<&Arc<RunningUnits>, StorageError> {
        Ok(&self.components()?.units)
    }

    pub fn completer(&self) -> Result<&Arc<Completer>, StorageError> {
        Ok(&self.components()?.completer)
    }

    pub fn authenticator(&self) -> Result<&Arc<Authenticator>, StorageError> {
        Ok(&self.components()?.authenticator)
    }

    pub fn log_handler(&self) -> Result<&Arc<LogHandler>, StorageError> {
        Ok(&self.components()?.handler)
    }

    pub fn log_store(&self) -> Result<&Arc<LogStore>, StorageError> {
        Ok(&self.components()?.store)
    }

    pub fn drainer(&self) -> Result<&Arc<LogDrainer>, StorageError> {
        Ok(&self.components()?.drainer)
    }

    pub fn sync_engine(&self) -> Result<&Arc<SyncEngine>, StorageError> {
        Ok(&self.components()?.sync)
    }

    pub fn garbage_collector(&self) -> Result<&Arc<GarbageCollector>, StorageError> {
        Ok(&self.components()?.gc)
    }

    pub fn cache(&self) -> Result<&Arc<LogCache>, StorageError> {
        Ok(&self.components()?.cache)
    }
}
