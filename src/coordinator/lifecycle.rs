// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, run, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::completion::Completer;
use crate::eviction::LogCache;
use crate::gc::GarbageCollector;
use crate::ingest::{
    Authenticator, HttpAuthority, IdentityAuthority, IngestError, LogDrainer, LogHandler, LogServer, LogStore,
    StaticAuthority,
};
use crate::kv::{KvStore, MemoryKv, RedisKv};
use crate::metrics;
use crate::storage::traits::StorageError;
use crate::storage::RunningUnits;
use crate::sync::{PeriodicScheduler, SyncEngine};

use super::{CdnEngine, Components, EngineState};

impl CdnEngine {
    /// Connect to backends and build every component.
    ///
    /// Startup flow:
    /// 1. Validate the configuration
    /// 2. Connect the catalog (retried, creates the schema)
    /// 3. Connect the KV service (Redis when configured, in-process otherwise)
    /// 4. Start every storage unit and bind it to its catalog record
    /// 5. Wire ingestion, sync and GC
    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        let startup_start = Instant::now();
        info!("Starting CDN engine");
        self.set_state(EngineState::Connecting);
        self.config.validate()?;

        let phase_start = Instant::now();
        let catalog = Arc::new(Catalog::connect(&self.config.catalog_url).await?);
        metrics::record_startup_phase("catalog", phase_start.elapsed());

        let phase_start = Instant::now();
        let kv: Arc<dyn KvStore> = match (&self.kv_override, &self.config.redis_url) {
            (Some(kv), _) => Arc::clone(kv),
            (None, Some(url)) => Arc::new(RedisKv::with_prefix(url, self.config.redis_prefix.as_deref()).await?),
            (None, None) => {
                warn!("No redis_url configured, using the in-process KV service (single node only)");
                Arc::new(MemoryKv::new())
            }
        };
        metrics::record_startup_phase("kv", phase_start.elapsed());

        let phase_start = Instant::now();
        let units = Arc::new(RunningUnits::init(&catalog, &self.config.units, kv.clone()).await?);
        metrics::record_startup_phase("units", phase_start.elapsed());
        if units.writable_storage_count() == 0 {
            warn!("No writable storage unit configured, content stays in the buffer");
        }

        let lease_ttl = Duration::from_secs(self.config.gc.item_lock_ttl_secs);
        let completer = Arc::new(Completer::new(catalog.clone(), units.clone(), &self.holder, lease_ttl));
        let cache = Arc::new(LogCache::new(kv.clone(), &self.config.lru));

        let authority = self.identity_authority()?;
        let authenticator = Arc::new(Authenticator::new(
            authority,
            Duration::from_secs(self.config.identity.key_cache_ttl_secs),
        ));
        let handler = Arc::new(LogHandler::new(kv.clone(), authenticator.clone(), &self.config.log));
        let store = Arc::new(LogStore::new(
            catalog.clone(),
            units.clone(),
            kv.clone(),
            completer.clone(),
            self.events.clone(),
            self.sync_trigger.clone(),
        ));
        let drainer = Arc::new(LogDrainer::new(kv.clone(), store.clone(), &self.holder, &self.config.log));
        let server = Arc::new(LogServer::new(
            self.config.tcp.clone(),
            self.config.log.step_lines_rate_limit,
            handler.clone(),
        ));

        let sync = Arc::new(SyncEngine::new(catalog.clone(), units.clone(), &self.holder, lease_ttl));
        let gc = Arc::new(
            GarbageCollector::new(catalog.clone(), units.clone(), completer.clone(), &self.holder, &self.config.gc)
                .with_cache(cache.clone())
                .with_sync_trigger(self.sync_trigger.clone()),
        );

        self.components = Some(Components {
            catalog,
            kv,
            units,
            completer,
            cache,
            authenticator,
            handler,
            store,
            drainer,
            server,
            sync,
            gc,
        });

        metrics::record_startup_phase("total", startup_start.elapsed());
        self.set_state(EngineState::Ready);
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "CDN engine ready");
        Ok(())
    }

    fn identity_authority(&mut self) -> Result<Arc<dyn IdentityAuthority>, StorageError> {
        if let Some(authority) = self.authority.take() {
            return Ok(authority);
        }
        if self.config.identity.api_url.is_some() {
            return Ok(Arc::new(HttpAuthority::new(&self.config.identity)?));
        }
        warn!("No identity authority configured, every log frame will be rejected");
        Ok(Arc::new(StaticAuthority::new()))
    }

    /// Serve until [`shutdown()`](Self::shutdown).
    ///
    /// Failing to bind the listener is the only fatal error. Once stopping,
    /// the listener closes first, open connections get `tcp.drain_timeout_secs`
    /// and every loop finishes its current pass.
    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    pub async fn run(&self) -> Result<(), IngestError> {
        let components = self.components()?;
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let listener = components.server.bind().await?;
        self.set_state(EngineState::Running);
        info!("CDN engine running");

        let server = tokio::spawn(Arc::clone(&components.server).serve(listener, shutdown.clone()));
        let drainer = tokio::spawn(Arc::clone(&components.drainer).run(shutdown.clone()));
        let mut scheduler = PeriodicScheduler::new(shutdown.clone());
        components.sync.schedule(&mut scheduler, self.sync_trigger.clone());
        components.gc.schedule(&mut scheduler, &self.config.lru);
        info!(loops = scheduler.len(), "Background loops scheduled");

        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        let shutdown_start = Instant::now();
        self.set_state(EngineState::ShuttingDown);
        info!("Stopping CDN engine");
        if let Err(e) = server.await {
            warn!(error = %e, "Log server task failed");
        }
        if let Err(e) = drainer.await {
            warn!(error = %e, "Log drainer task failed");
        }
        scheduler.join().await;

        metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        self.set_state(EngineState::Stopped);
        info!("CDN engine stopped");
        Ok(())
    }

    /// Signal every background task to stop and wait until they have.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let mut state = self.state_receiver();
        loop {
            let current = *state.borrow_and_update();
            match current {
                EngineState::Running | EngineState::ShuttingDown => {}
                EngineState::Stopped => return,
                _ => {
                    // never ran
                    self.set_state(EngineState::Stopped);
                    return;
                }
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }
}
