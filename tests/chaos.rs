//! Chaos Testing for the CDN engine
//!
//! This module tests failure scenarios using:
//! 1. **FailingStore wrapper** - object store errors switched on and off mid-flow
//! 2. **Lease contention** - another node holding item leases or drain heartbeats
//! 3. **Data corruption** - buffered content that no longer matches its digest
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdn_engine::catalog::item_lock_key;
use cdn_engine::config::GcConfig;
use cdn_engine::ingest::heartbeat_key;
use cdn_engine::item::LogApiRef;
use cdn_engine::storage::traits::{ObjectStore, Unit};
use cdn_engine::storage::{DriverUnit, KvBuffer, MemoryObjectStore, Position, RunningStorage, RunningUnits};
use cdn_engine::{
    Addressing, ApiRef, BufferUnit, Catalog, CompletionOutcome, Completer, GarbageCollector, Item, ItemType, KvStore,
    MemoryKv, RetryConfig, StorageError, SyncEngine,
};
use tempfile::TempDir;

// =============================================================================
// Failing Store Wrapper - Error Injection
// =============================================================================

/// Object store that fails every call while `failing` is set.
pub struct FailingStore {
    inner: MemoryObjectStore,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FailingStore {
    pub fn new() -> Self {
        Self { inner: MemoryObjectStore::new(), failing: AtomicBool::new(false), calls: AtomicU64::new(0) }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Backend("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for FailingStore {
    fn driver(&self) -> &'static str {
        "failing"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.exists(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.check()?;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    catalog: Arc<Catalog>,
    kv: Arc<dyn KvStore>,
    units: Arc<RunningUnits>,
    completer: Arc<Completer>,
    sync: Arc<SyncEngine>,
    gc: GarbageCollector,
    store: Arc<FailingStore>,
    _dir: TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("chaos.db").display());
    let catalog = Arc::new(Catalog::connect(&url).await.unwrap());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let store = Arc::new(FailingStore::new());
    let buffer: Arc<dyn BufferUnit> = Arc::new(KvBuffer::new("buffer", kv.clone()));
    let flaky = DriverUnit::new("flaky", store.clone(), Addressing::Identity);
    let units = Arc::new(
        RunningUnits::with_units(&catalog, buffer, vec![RunningStorage::new(Arc::new(flaky))])
            .await
            .unwrap(),
    );

    let ttl = Duration::from_secs(30);
    let completer = Arc::new(
        Completer::new(catalog.clone(), units.clone(), "node-a", ttl).with_retry(RetryConfig::test()),
    );
    let sync = Arc::new(SyncEngine::new(catalog.clone(), units.clone(), "node-a", ttl));
    let gc_config = GcConfig { buffer_min_age_secs: 0, ..Default::default() };
    let gc = GarbageCollector::new(catalog.clone(), units.clone(), completer.clone(), "node-a", &gc_config);

    Fixture { catalog, kv, units, completer, sync, gc, store, _dir: dir }
}

impl Fixture {
    /// A completed step log for `job` holding `lines`.
    async fn completed_item(&self, job: i64, lines: &[&str]) -> Item {
        let api_ref = ApiRef::Log(LogApiRef {
            project_key: "PROJ".into(),
            run_id: 7,
            node_run_job_id: job,
            step_order: Some(0),
            ..Default::default()
        });
        let item = self.catalog.load_or_create_item(&api_ref, ItemType::StepLog).await.unwrap();
        let iu = self.units.buffer_item_unit(&self.catalog, &item).await.unwrap();
        for (n, line) in lines.iter().enumerate() {
            self.units
                .buffer()
                .add(&iu, Position::new(n as u64, 0), &format!("{}\n", line))
                .await
                .unwrap();
        }
        match self.completer.complete(&item.id).await.unwrap() {
            CompletionOutcome::Completed(item) => item,
            CompletionOutcome::AlreadyCompleted(item) => item,
        }
    }

    fn flaky_id(&self) -> String {
        self.units.storage("flaky").unwrap().unit.id()
    }
}

// =============================================================================
// Failing backend
// =============================================================================

#[tokio::test]
async fn chaos_write_failure_records_no_placement() {
    let f = fixture().await;
    let item = f.completed_item(1, &["alpha", "beta"]).await;

    f.store.set_failing(true);
    let report = f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.copied, 0);
    assert!(f.catalog.load_item_unit(&f.flaky_id(), &item.id).await.unwrap().is_none());

    // the lease was released, so the next pass can copy
    f.store.set_failing(false);
    let report = f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(report.copied, 1);
    assert!(f.catalog.load_item_unit(&f.flaky_id(), &item.id).await.unwrap().is_some());
}

#[tokio::test]
async fn chaos_failures_stay_per_item() {
    let f = fixture().await;
    for job in 0..5 {
        f.completed_item(job, &["same", &format!("job {}", job)]).await;
    }
    f.store.set_failing(true);
    let report = f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(report.candidates, 5);
    assert_eq!(report.failed, 5);
    assert!(f.store.calls() >= 5);

    f.store.set_failing(false);
    assert_eq!(f.sync.sync_unit("flaky").await.unwrap().copied, 5);
}

#[tokio::test]
async fn chaos_delete_failure_keeps_placement_until_backend_recovers() {
    let f = fixture().await;
    let item = f.completed_item(1, &["to be purged"]).await;
    f.sync.sync_unit("flaky").await.unwrap();
    f.catalog.mark_item_to_delete(&item.id).await.unwrap();

    f.store.set_failing(true);
    let report = f.gc.purge_units().await;
    assert!(report.failed >= 1);
    assert!(f.catalog.load_item_unit(&f.flaky_id(), &item.id).await.unwrap().is_some());
    assert!(f.catalog.load_item(&item.id).await.unwrap().is_some());

    f.store.set_failing(false);
    f.gc.collect().await;
    assert!(f.catalog.load_item_unit(&f.flaky_id(), &item.id).await.unwrap().is_none());
    assert!(f.catalog.load_item(&item.id).await.unwrap().is_none());
}

#[tokio::test]
async fn chaos_reclaim_waits_for_failed_copies() {
    let f = fixture().await;
    f.completed_item(1, &["pending"]).await;

    f.store.set_failing(true);
    f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 0);

    f.store.set_failing(false);
    f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 1);
}

// =============================================================================
// Lease contention
// =============================================================================

#[tokio::test]
async fn chaos_item_leased_by_other_node_is_skipped() {
    let f = fixture().await;
    let item = f.completed_item(1, &["contended"]).await;
    let lease = item_lock_key(&item.id);
    f.catalog.try_lock(&lease, "node-b", Duration::from_secs(30)).await.unwrap();

    let report = f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.copied, 0);

    // completion by this node cannot proceed either
    assert!(f.completer.complete(&item.id).await.unwrap_err().is_locked());

    f.catalog.unlock(&lease, "node-b").await.unwrap();
    assert_eq!(f.sync.sync_unit("flaky").await.unwrap().copied, 1);
}

#[tokio::test]
async fn chaos_expired_lease_is_taken_over() {
    let f = fixture().await;
    let item = f.completed_item(1, &["abandoned"]).await;
    let lease = item_lock_key(&item.id);
    f.catalog.try_lock(&lease, "crashed-node", Duration::from_millis(50)).await.unwrap();

    assert_eq!(f.sync.sync_unit("flaky").await.unwrap().skipped, 1);
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(f.sync.sync_unit("flaky").await.unwrap().copied, 1);
}

#[tokio::test]
async fn chaos_crashed_drainer_heartbeat_expires() {
    let f = fixture().await;
    let heartbeat = heartbeat_key("42");
    assert!(f.kv.set_nx(&heartbeat, "crashed-node", Duration::from_millis(50)).await.unwrap());
    assert!(!f.kv.set_nx(&heartbeat, "node-a", Duration::from_secs(30)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(f.kv.set_nx(&heartbeat, "node-a", Duration::from_secs(30)).await.unwrap());
    assert_eq!(f.kv.get(&heartbeat).await.unwrap().as_deref(), Some("node-a"));
}

// =============================================================================
// Corruption
// =============================================================================

#[tokio::test]
async fn chaos_corrupt_buffer_is_not_promoted() {
    let f = fixture().await;
    let item = f.completed_item(1, &["original"]).await;
    let iu = f.units.buffer_item_unit(&f.catalog, &item).await.unwrap();
    f.units.buffer().add(&iu, Position::new(5, 0), "tampered\n").await.unwrap();

    let report = f.sync.sync_unit("flaky").await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(f.catalog.load_item_unit(&f.flaky_id(), &item.id).await.unwrap().is_none());
    assert_eq!(f.gc.reclaim_buffer().await.unwrap(), 0);
}
