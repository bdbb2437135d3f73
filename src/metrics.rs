// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cdn-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cdn_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for sizes
//!
//! # Labels
//! - `unit`: configured unit name
//! - `source`: worker, service
//! - `status`: accepted, rejected, dropped, truncated / copied, deduplicated, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "cdn_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error by component and kind
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "cdn_engine_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Ingestion
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one received log frame
pub fn record_log_message(source: &str, status: &str) {
    counter!(
        "cdn_engine_log_messages_total",
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Bytes read from ingestion sockets
pub fn record_ingest_bytes(bytes: usize) {
    counter!("cdn_engine_ingest_bytes_total").increment(bytes as u64);
}

/// Set currently open ingestion connections
pub fn set_tcp_connections(count: usize) {
    gauge!("cdn_engine_tcp_connections").set(count as f64);
}

/// Set number of jobs with queued log lines
pub fn set_waiting_jobs(count: u64) {
    gauge!("cdn_engine_waiting_jobs").set(count as f64);
}

/// Record one line moved from a job queue into the buffer
pub fn record_line_stored(status: &str) {
    counter!(
        "cdn_engine_lines_stored_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an item flip to Completed
pub fn record_item_completed(item_type: &str, size: i64) {
    counter!(
        "cdn_engine_items_completed_total",
        "item_type" => item_type.to_string()
    )
    .increment(1);
    histogram!(
        "cdn_engine_item_size_bytes",
        "item_type" => item_type.to_string()
    )
    .record(size as f64);
}

/// Record a lease that could not be taken
pub fn record_lock_contention(resource: &str) {
    counter!(
        "cdn_engine_lock_contention_total",
        "resource" => resource.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// Sync
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one item copy
pub fn record_sync(unit: &str, status: &str) {
    counter!(
        "cdn_engine_sync_items_total",
        "unit" => unit.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Bytes written to a storage unit by sync
pub fn record_sync_bytes(unit: &str, bytes: usize) {
    counter!(
        "cdn_engine_sync_bytes_total",
        "unit" => unit.to_string()
    )
    .increment(bytes as u64);
}

/// Set how many candidates the last sync pass found
pub fn set_sync_backlog(unit: &str, count: usize) {
    gauge!(
        "cdn_engine_sync_backlog",
        "unit" => unit.to_string()
    )
    .set(count as f64);
}

/// Record a hash mismatch on read
pub fn record_corruption(unit: &str) {
    counter!(
        "cdn_engine_corruption_detected_total",
        "unit" => unit.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// GC / LRU
// ═══════════════════════════════════════════════════════════════════════════

/// Record rows handled by a GC pass
pub fn record_gc(pass: &str, count: usize) {
    counter!(
        "cdn_engine_gc_items_total",
        "pass" => pass.to_string()
    )
    .increment(count as u64);
}

/// Record an LRU lookup
pub fn record_lru(hit: bool) {
    counter!(
        "cdn_engine_lru_requests_total",
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Set bytes held by the LRU
pub fn set_lru_bytes(bytes: u64) {
    gauge!("cdn_engine_lru_bytes").set(bytes as f64);
}

/// Record LRU eviction
pub fn record_lru_eviction(count: usize, bytes: u64) {
    counter!("cdn_engine_lru_evictions_total").increment(count as u64);
    counter!("cdn_engine_lru_evicted_bytes_total").increment(bytes);
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "cdn_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set engine state as a labelled gauge
pub fn set_engine_state(state: &str) {
    for s in ["Created", "Connecting", "Ready", "Running", "ShuttingDown", "Stopped"] {
        gauge!(
            "cdn_engine_state",
            "state" => s
        )
        .set(if s == state { 1.0 } else { 0.0 });
    }
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
