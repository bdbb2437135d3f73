// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Backend connections, catalog queries and lock contention all retry with
//! the same loop; the presets differ only in patience.
//!
//! # Example
//!
//! ```
//! use cdn_engine::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Daemon: never give up on reconnection
//! let daemon = RetryConfig::daemon();
//! assert_eq!(daemon.max_retries, None);
//!
//! // Lock contention: a handful of short waits, then report the item as busy
//! let lock = RetryConfig::lock();
//! assert_eq!(lock.max_retries, Some(5));
//! ```

use std::time::Duration;
use tokio::time::sleep;
use tracing::{warn, info};
use std::future::Future;

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::daemon()`] - Infinite retry for runtime reconnection
/// - [`RetryConfig::query()`] - Quick retry for individual operations
/// - [`RetryConfig::lock()`] - Bounded retry on row/lease contention
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::daemon()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    /// Use this during daemon startup to detect configuration errors quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry for long-running daemon (never give up!).
    /// Retries forever with exponential backoff capped at 5 minutes.
    /// Use this for runtime reconnection after initial startup succeeds.
    #[must_use]
    pub fn daemon() -> Self {
        Self {
            max_retries: None, // Infinite
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // Cap at 5 minutes
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Bounded retry for `Locked` outcomes (completion racing a sync or GC pass).
    /// Short fixed-ish delays so a fragment stream is not held up for long.
    #[must_use]
    pub fn lock() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(400),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[must_use]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Backoff following `delay`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }

    /// Worst-case time spent sleeping before giving up, `None` when unbounded.
    #[must_use]
    pub fn total_budget(&self) -> Option<Duration> {
        let retries = self.max_retries?;
        let mut delay = self.initial_delay;
        let mut total = Duration::ZERO;
        for _ in 1..retries {
            total += delay;
            delay = self.next_delay(delay);
        }
        Some(total)
    }
}

/// Retry `operation` until it succeeds or the preset gives up.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Like [`retry`], but only errors accepted by `should_retry` are retried;
/// anything else is returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                if !should_retry(&err) {
                    return Err(err);
                }
                attempts += 1;

                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        max_attempts = max,
                        error = %err,
                        next_in = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        operation = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_in = ?delay,
                        "Operation failed, will retry forever"
                    ),
                }

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Operation failing with `errors` in turn, then returning the attempt count.
    fn scripted(
        errors: Vec<StorageError>,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<usize, StorageError>> + Send>> {
        let errors = Arc::new(parking_lot::Mutex::new(errors.into_iter()));
        move || {
            let errors = errors.clone();
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                match errors.lock().next() {
                    Some(e) => Err(e),
                    None => Ok(n),
                }
            })
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result = retry("catalog_query", &RetryConfig::test(), scripted(vec![], calls.clone())).await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_backend_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = vec![
            StorageError::Backend("connection reset".into()),
            StorageError::Backend("connection reset".into()),
        ];
        let result = retry("redis_zadd", &RetryConfig::test(), scripted(errors, calls.clone())).await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = (0..10).map(|_| StorageError::Backend("down".into())).collect();
        let result = retry("redis_zadd", &RetryConfig::test(), scripted(errors, calls.clone())).await;
        assert!(matches!(result, Err(StorageError::Backend(msg)) if msg == "down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_only_retries_lock_contention() {
        let calls = Arc::new(AtomicUsize::new(0));
        let errors = vec![StorageError::NotFound];
        let result = retry_if("complete", &RetryConfig::test(), StorageError::is_locked, scripted(errors, calls.clone())).await;
        assert!(matches!(result, Err(StorageError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let errors = vec![StorageError::Locked("item:1".into()), StorageError::Locked("item:1".into())];
        let result = retry_if("complete", &RetryConfig::test(), StorageError::is_locked, scripted(errors, calls.clone())).await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_config_presets() {
        assert_eq!(RetryConfig::startup().max_retries, Some(5));
        assert_eq!(RetryConfig::daemon().max_retries, None);
        assert_eq!(RetryConfig::query().max_retries, Some(3));

        let lock = RetryConfig::lock();
        assert_eq!(lock.max_retries, Some(5));
        assert!(lock.max_delay <= Duration::from_secs(1));
    }

    #[test]
    fn test_next_delay_doubles_then_caps() {
        let lock = RetryConfig::lock();
        assert_eq!(lock.next_delay(Duration::from_millis(50)), Duration::from_millis(100));
        assert_eq!(lock.next_delay(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(lock.next_delay(Duration::from_millis(300)), Duration::from_millis(400));
    }

    #[test]
    fn test_total_budget() {
        // 50 + 100 + 200 + 400 between five attempts
        assert_eq!(RetryConfig::lock().total_budget(), Some(Duration::from_millis(750)));
        assert_eq!(RetryConfig::daemon().total_budget(), None);
        assert!(RetryConfig::startup().total_budget().unwrap() < Duration::from_secs(10));
    }
}
