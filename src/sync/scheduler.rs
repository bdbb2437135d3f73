// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named periodic loops sharing one shutdown signal.
//!
//! Each loop runs its task to completion before checking for shutdown again,
//! so in-flight backend writes are never cut short. Ticks that fall due while
//! a task is still running are delayed, not bunched up.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct PeriodicScheduler {
    shutdown: watch::Receiver<bool>,
    loops: JoinSet<()>,
    names: Vec<String>,
}

impl PeriodicScheduler {
    #[must_use]
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown, loops: JoinSet::new(), names: Vec::new() }
    }

    /// Run `task` every `period`, first one period from now.
    pub fn every<F, Fut>(&mut self, name: &str, period: Duration, task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_loop(name, Some(period), None, task);
    }

    /// Run `task` each time `trigger` is notified. Notifications that arrive
    /// while the task runs coalesce into one more run.
    pub fn on_notify<F, Fut>(&mut self, name: &str, trigger: Arc<Notify>, task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_loop(name, None, Some(trigger), task);
    }

    fn spawn_loop<F, Fut>(&mut self, name: &str, period: Option<Duration>, trigger: Option<Arc<Notify>>, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.clone();
        let loop_name = name.to_string();
        self.names.push(loop_name.clone());

        self.loops.spawn(async move {
            // a disabled timer is a tick that never comes
            let period = period.unwrap_or(Duration::from_secs(365 * 24 * 3600));
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let trigger = trigger.unwrap_or_default();

            debug!(task = %loop_name, period_ms = period.as_millis() as u64, "Periodic task started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                    _ = trigger.notified() => {}
                }
                task().await;
            }
            debug!(task = %loop_name, "Periodic task stopped");
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Wait for every loop to observe shutdown and finish its current run.
    pub async fn join(mut self) {
        while self.loops.join_next().await.is_some() {}
        info!(loops = self.names.len(), "Periodic tasks stopped");
    }

    /// Stop waiting after `timeout` and abort whatever is still running.
    pub async fn join_timeout(mut self, timeout: Duration) {
        let finished = tokio::time::timeout(timeout, async {
            while self.loops.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            self.loops.abort_all();
            while self.loops.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_period() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = PeriodicScheduler::new(rx);
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.every("tick", Duration::from_secs(10), counter_task(&runs));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_triggers_run() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = PeriodicScheduler::new(rx);
        let runs = Arc::new(AtomicUsize::new(0));
        let trigger = Arc::new(Notify::new());
        scheduler.on_notify("on-complete", trigger.clone(), counter_task(&runs));

        trigger.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        scheduler.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_loops() {
        let (tx, rx) = watch::channel(false);
        let mut scheduler = PeriodicScheduler::new(rx);
        let runs = Arc::new(AtomicUsize::new(0));
        scheduler.every("a", Duration::from_secs(1), counter_task(&runs));
        scheduler.every("b", Duration::from_secs(2), counter_task(&runs));
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.names(), ["a".to_string(), "b".to_string()]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), scheduler.join()).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
