// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the proxy data cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The parent daemon is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `pdc_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: autoregistration, history, discovery
//! - `destination`: memory, database, none
//! - `status`: success, error, rejected, timeout

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

// ═══════════════════════════════════════════════════════════════════════════
// INGEST - Producer-facing write path
// ═══════════════════════════════════════════════════════════════════════════

/// Record a write call and where it landed
pub fn record_write(kind: &str, destination: &str, status: &str) {
    counter!(
        "pdc_writes_total",
        "kind" => kind.to_string(),
        "destination" => destination.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a failed write by error class
pub fn record_ingest_error(kind: &str, error_type: &str) {
    counter!(
        "pdc_ingest_errors_total",
        "kind" => kind.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record the one-way fallback from the memory tier to database-only
pub fn record_memory_fallback() {
    counter!("pdc_memory_fallback_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// FLUSH - Batch delivery to the collector
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed flush batch attempt
pub fn record_flush_batch(kind: &str, status: &str) {
    counter!(
        "pdc_flush_batches_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record records acknowledged by the collector
pub fn record_flushed_records(kind: &str, count: usize) {
    counter!(
        "pdc_flushed_records_total",
        "kind" => kind.to_string()
    )
    .increment(count as u64);
    histogram!(
        "pdc_flush_batch_size",
        "kind" => kind.to_string()
    )
    .record(count as f64);
}

/// Record end-to-end delivery latency for one batch
pub fn record_delivery_latency(kind: &str, duration: Duration) {
    histogram!(
        "pdc_delivery_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a delivery retry and why
pub fn record_delivery_retry(kind: &str, reason: &str) {
    counter!(
        "pdc_delivery_retries_total",
        "kind" => kind.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a drain failure against the backend
pub fn record_drain_error(kind: &str) {
    counter!(
        "pdc_drain_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER STATE - Pending work and retention
// ═══════════════════════════════════════════════════════════════════════════

/// Set records awaiting delivery for one kind on one destination
pub fn set_pending_records(kind: &str, destination: &str, count: u64) {
    gauge!(
        "pdc_pending_records",
        "kind" => kind.to_string(),
        "destination" => destination.to_string()
    )
    .set(count as f64);
}

/// Record unacknowledged records dropped by retention expiry
pub fn record_expired(kind: &str, count: u64) {
    counter!(
        "pdc_expired_records_total",
        "kind" => kind.to_string()
    )
    .increment(count);
}

/// Set the operating mode gauge (0 = disabled, 1 = memory, 2 = database,
/// 3 = database_only)
pub fn set_cache_mode(mode: u8) {
    gauge!("pdc_cache_mode").set(mode as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE - Startup and state transitions
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "pdc_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an engine state transition
pub fn set_engine_state(state: &str) {
    counter!(
        "pdc_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record generic operation latency
pub fn record_latency(stage: &str, operation: &str, duration: Duration) {
    histogram!(
        "pdc_operation_seconds",
        "stage" => stage.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str, operation: &'static str) -> Self {
        Self {
            stage,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.stage, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($stage:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($stage, $op)
    };
}
