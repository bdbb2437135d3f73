// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background draining of per-job queues.
//!
//! Each job queue is drained by exactly one worker at a time. Ownership is a
//! heartbeat key (`SET NX` with TTL) refreshed while the worker drains; a
//! crashed worker stops refreshing and the job becomes claimable again once
//! the TTL lapses.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::store::LogStore;
use super::{heartbeat_key, job_queue_key, WAITING_JOBS_KEY};
use crate::config::LogConfig;
use crate::item::now_millis;
use crate::kv::KvStore;
use crate::metrics;
use crate::storage::traits::StorageError;

pub struct LogDrainer {
    kv: Arc<dyn KvStore>,
    store: Arc<LogStore>,
    holder: String,
    workers: Arc<Semaphore>,
    heartbeat_ttl: Duration,
    dequeue_timeout: Duration,
    poll_interval: Duration,
}

impl LogDrainer {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, store: Arc<LogStore>, holder: &str, config: &LogConfig) -> Self {
        Self {
            kv,
            store,
            holder: holder.to_string(),
            workers: Arc::new(Semaphore::new(config.nb_job_log_workers.max(1))),
            heartbeat_ttl: Duration::from_secs(config.heartbeat_ttl_secs.max(1)),
            dequeue_timeout: Duration::from_millis(config.dequeue_timeout_ms.max(1)),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    /// Poll the waiting set until shutdown, then let in-flight drains finish.
    #[tracing::instrument(skip_all, fields(holder = %self.holder))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Log drainer started");
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            while tasks.try_join_next().is_some() {}
            if let Err(e) = self.dispatch(&mut tasks).await {
                warn!(error = %e, "Cannot scan waiting jobs");
            }
        }
        debug!(in_flight = tasks.len(), "Waiting for drains to finish");
        while tasks.join_next().await.is_some() {}
        info!("Log drainer stopped");
    }

    /// Claim idle jobs and spawn a drain for each, up to the free worker count.
    pub async fn dispatch(self: &Arc<Self>, tasks: &mut JoinSet<usize>) -> Result<usize, StorageError> {
        let jobs = self.kv.zrange(WAITING_JOBS_KEY, 0, -1, false).await?;
        metrics::set_waiting_jobs(jobs.len() as u64);

        let mut started = 0;
        for (job_key, _) in jobs {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                break;
            };
            if !self.claim(&job_key).await? {
                continue;
            }
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permit;
                this.drain_job(&job_key).await
            });
            started += 1;
        }
        Ok(started)
    }

    /// Take the drain lease on a job.
    pub async fn claim(&self, job_key: &str) -> Result<bool, StorageError> {
        self.kv.set_nx(&heartbeat_key(job_key), &self.holder, self.heartbeat_ttl).await
    }

    /// Drain a claimed job until its queue stays empty, then release it.
    ///
    /// Returns the number of fragments handled. Store failures are per
    /// fragment and do not stop the drain.
    pub async fn drain_job(&self, job_key: &str) -> usize {
        let queue = job_queue_key(job_key);
        let heartbeat = heartbeat_key(job_key);
        let refresh_every = self.heartbeat_ttl / 3;
        let mut last_refresh = Instant::now();
        let mut drained = 0;

        loop {
            if last_refresh.elapsed() >= refresh_every {
                match self.refresh_lease(&heartbeat).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job = %job_key, drained, "Drain lease taken over, stopping");
                        return drained;
                    }
                    Err(e) => warn!(job = %job_key, error = %e, "Cannot refresh drain lease"),
                }
                last_refresh = Instant::now();
            }

            match self.kv.pop_timeout(&queue, self.dequeue_timeout).await {
                Ok(Some(raw)) => {
                    drained += 1;
                    if let Err(e) = self.store.store_raw(&raw).await {
                        warn!(job = %job_key, error = %e, "Cannot store log fragment");
                        metrics::record_line_stored("error");
                    }
                }
                Ok(None) => match self.release_if_idle(job_key, &queue).await {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(job = %job_key, error = %e, "Cannot update waiting jobs");
                        break;
                    }
                },
                Err(e) => {
                    warn!(job = %job_key, error = %e, "Cannot dequeue log fragment");
                    break;
                }
            }
        }

        self.release(&heartbeat).await;
        debug!(job = %job_key, drained, "Job queue drained");
        drained
    }

    /// Extend the drain lease if this node still holds it.
    ///
    /// Returns `false` once the lease expired and another node claimed the job.
    pub async fn refresh_lease(&self, heartbeat: &str) -> Result<bool, StorageError> {
        match self.kv.get(heartbeat).await? {
            Some(owner) if owner == self.holder => self.kv.expire(heartbeat, self.heartbeat_ttl).await,
            _ => Ok(false),
        }
    }

    /// Leave the waiting set unless a producer pushed in the meantime.
    async fn release_if_idle(&self, job_key: &str, queue: &str) -> Result<bool, StorageError> {
        self.kv.zrem(WAITING_JOBS_KEY, job_key).await?;
        if self.kv.llen(queue).await? > 0 {
            self.kv.zadd(WAITING_JOBS_KEY, now_millis() as f64, job_key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn release(&self, heartbeat: &str) {
        match self.kv.get(heartbeat).await {
            Ok(Some(owner)) if owner == self.holder => {
                if let Err(e) = self.kv.delete(heartbeat).await {
                    warn!(key = %heartbeat, error = %e, "Cannot release drain lease, it will expire");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(key = %heartbeat, error = %e, "Cannot read drain lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::sqlite_catalog;
    use crate::catalog::Catalog;
    use crate::completion::Completer;
    use crate::events::EventBus;
    use crate::ingest::handler::QueuedLine;
    use crate::ingest::message::build_line;
    use crate::ingest::test_support::step_signature;
    use crate::item::{ApiRef, ItemStatus, ItemType};
    use crate::kv::MemoryKv;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::traits::BufferUnit;
    use crate::storage::{KvBuffer, RunningUnits};
    use tokio::sync::Notify;

    async fn setup(holder: &str, kv: Arc<dyn KvStore>) -> (Arc<Catalog>, tempfile::TempDir, Arc<LogDrainer>) {
        let (catalog, dir) = sqlite_catalog().await;
        let catalog = Arc::new(catalog);
        let buffer: Arc<dyn BufferUnit> = Arc::new(KvBuffer::new("buffer", kv.clone()));
        let units = Arc::new(RunningUnits::with_units(&catalog, buffer, Vec::new()).await.unwrap());
        let completer = Arc::new(
            Completer::new(catalog.clone(), units.clone(), holder, Duration::from_secs(30)).with_retry(RetryConfig::test()),
        );
        let store = Arc::new(LogStore::new(catalog.clone(), units, kv.clone(), completer, EventBus::default(), Arc::new(Notify::new())));
        let config = LogConfig { dequeue_timeout_ms: 20, poll_interval_ms: 10, heartbeat_ttl_secs: 30, ..Default::default() };
        (catalog, dir, Arc::new(LogDrainer::new(kv, store, holder, &config)))
    }

    async fn enqueue(kv: &dyn KvStore, n: u64, text: &str, terminated: bool) {
        let line = QueuedLine {
            signature: step_signature(42, 1),
            item_type: ItemType::StepLog,
            line: n,
            content: build_line(6, text),
            terminated,
            truncated: false,
        };
        kv.push(&job_queue_key("42"), &serde_json::to_string(&line).unwrap()).await.unwrap();
        kv.zadd(WAITING_JOBS_KEY, 0.0, "42").await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_stores_and_releases() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        enqueue(kv.as_ref(), 0, "hello", false).await;
        enqueue(kv.as_ref(), 1, "bye", true).await;

        let mut tasks = JoinSet::new();
        assert_eq!(drainer.dispatch(&mut tasks).await.unwrap(), 1);
        assert_eq!(tasks.join_next().await.unwrap().unwrap(), 2);

        assert_eq!(kv.zcard(WAITING_JOBS_KEY).await.unwrap(), 0);
        assert!(!kv.exists(&heartbeat_key("42")).await.unwrap());

        let api_ref = ApiRef::Log(step_signature(42, 1).log_api_ref());
        let item = catalog
            .load_item_by_api_ref_hash(&api_ref.hash().unwrap(), ItemType::StepLog)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn test_leased_job_is_skipped() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        enqueue(kv.as_ref(), 0, "hello", false).await;
        kv.set_nx(&heartbeat_key("42"), "node-b", Duration::from_secs(30)).await.unwrap();

        let mut tasks = JoinSet::new();
        assert_eq!(drainer.dispatch(&mut tasks).await.unwrap(), 0);
        assert_eq!(kv.llen(&job_queue_key("42")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        enqueue(kv.as_ref(), 0, "hello", false).await;
        kv.set_nx(&heartbeat_key("42"), "crashed", Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let mut tasks = JoinSet::new();
        assert_eq!(drainer.dispatch(&mut tasks).await.unwrap(), 1);
        assert_eq!(tasks.join_next().await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_lease() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        kv.set(&heartbeat_key("7"), "node-b", None).await.unwrap();
        assert_eq!(drainer.drain_job("7").await, 0);
        assert_eq!(kv.get(&heartbeat_key("7")).await.unwrap().as_deref(), Some("node-b"));
    }

    #[tokio::test]
    async fn test_refresh_extends_own_lease() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        kv.set_nx(&heartbeat_key("42"), "node-a", Duration::from_millis(30)).await.unwrap();

        assert!(drainer.refresh_lease(&heartbeat_key("42")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get(&heartbeat_key("42")).await.unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn test_refresh_leaves_foreign_lease_alone() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        kv.set_nx(&heartbeat_key("42"), "node-b", Duration::from_millis(30)).await.unwrap();

        assert!(!drainer.refresh_lease(&heartbeat_key("42")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!kv.exists(&heartbeat_key("42")).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_of_expired_lease_fails() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        assert!(!drainer.refresh_lease(&heartbeat_key("42")).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let (_catalog, _dir, drainer) = setup("node-a", kv.clone()).await;
        enqueue(kv.as_ref(), 0, "hello", true).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(drainer.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(kv.llen(&job_queue_key("42")).await.unwrap(), 0);
    }
}
