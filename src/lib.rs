//! # CDN Engine
//!
//! Storage, ingestion and lifecycle engine for CI logs and artifacts.
//!
//! ## Architecture
//!
//! Content lands in a fast KV-backed buffer first and is promoted into
//! durable storage units by a background sync engine. Garbage collection
//! removes buffer copies once every writable unit holds the item.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Log Ingestion                         │
//! │  • TCP, null-byte framed JSON envelopes                     │
//! │  • Signed origin claims (HS512 worker / EdDSA hatchery)     │
//! │  • Per-job size cap, per-job queues, heartbeat drainers     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   (ordered append, completion)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Buffer (KV ordered sets)                  │
//! │  • One ordered set per item, scored by line position        │
//! │  • Redis in production, in-process for tests                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                 (periodic sync per storage unit)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Storage Units                         │
//! │  • local / nfs / s3 / webdav / upstream / memory            │
//! │  • Convergent locators and encryption, shared copies        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The SQL catalog records every item, every placement (item unit) and
//! every unit, plus short item leases that serialize completion, sync and
//! purge across processes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cdn_engine::{CdnConfig, CdnEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CdnConfig::load("cdn.toml").expect("Bad config");
//!     let mut engine = CdnEngine::new(config);
//!     engine.start().await.expect("Failed to start");
//!
//!     let engine = Arc::new(engine);
//!     let runner = tokio::spawn({
//!         let engine = Arc::clone(&engine);
//!         async move { engine.run().await }
//!     });
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     engine.shutdown().await;
//!     runner.await.unwrap().unwrap();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`CdnEngine`] wiring every component, plus the read and admin API
//! - [`catalog`]: SQL catalog of items, placements, units and leases
//! - [`kv`]: Ordered-set / string / list service (Redis or in-process)
//! - [`storage`]: Buffer and storage unit capabilities and their drivers
//! - [`convergent`]: Content-derived locators and encryption keys
//! - [`ingest`]: TCP log ingestion pipeline
//! - [`completion`]: Item completion under the item lease
//! - [`sync`]: Buffer → storage promotion and the periodic scheduler
//! - [`gc`]: Buffer reclaim, stuck items, purge
//! - [`eviction`]: LRU cache of decoded log content
//! - [`resilience`]: Retry policies

pub mod catalog;
pub mod completion;
pub mod config;
pub mod convergent;
pub mod coordinator;
pub mod events;
pub mod eviction;
pub mod gc;
pub mod ingest;
pub mod item;
pub mod kv;
pub mod metrics;
pub mod resilience;
pub mod storage;
pub mod sync;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use catalog::Catalog;
pub use completion::{CompletionOutcome, Completer};
pub use config::{CdnConfig, DriverConfig, StorageConfig};
pub use convergent::{Addressing, Convergent, EncryptionConfig};
pub use coordinator::{CdnEngine, EngineState, ResyncReport, UnitInfo};
pub use events::{EventBus, ItemEvent, ItemEventKind};
pub use eviction::{CacheStatus, LogCache};
pub use gc::{GarbageCollector, PurgeReport};
pub use ingest::{IngestError, LogMessage, Signature};
pub use item::{ApiRef, ContentDigest, Item, ItemStatus, ItemType, ItemUnit, UnitRecord};
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{BufferUnit, ReadOrder, StorageError, StorageUnit};
pub use sync::{SyncEngine, SyncReport};
