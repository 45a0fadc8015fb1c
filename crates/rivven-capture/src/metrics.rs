//! # Capture Metrics
//!
//! Lock-free counters for the capture pipeline, mirrored to the `metrics`
//! facade so any installed exporter (Prometheus, StatsD, ...) picks them up.
//! No exporter is installed by this crate.
//!
//! ## Emitted Series
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `rivven_capture_events_enqueued_total` | counter | `server` |
//! | `rivven_capture_events_polled_total` | counter | `server` |
//! | `rivven_capture_queue_depth` | gauge | `server` |
//! | `rivven_capture_phase` | gauge | `server`, `phase` |
//! | `rivven_capture_snapshot_rows_total` | counter | `server`, `table` |
//! | `rivven_capture_incremental_windows_total` | counter | `server` |
//! | `rivven_capture_events_delivered_total` | counter | `server` |
//! | `rivven_capture_events_skipped_total` | counter | `server` |
//! | `rivven_capture_events_cancelled_total` | counter | `server` |
//! | `rivven_capture_delivery_errors_total` | counter | `server`, `code` |
//! | `rivven_capture_batch_duration_seconds` | histogram | `server` |
//!
//! ## Usage
//!
//! ```ignore
//! let metrics = CaptureMetrics::new("server1");
//! metrics.record_enqueued(1);
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.events_enqueued, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Capture pipeline metrics with atomic counters.
#[derive(Debug)]
pub struct CaptureMetrics {
    server: String,
    events_enqueued: AtomicU64,
    events_polled: AtomicU64,
    snapshot_rows: AtomicU64,
    incremental_windows: AtomicU64,
    events_delivered: AtomicU64,
    events_skipped: AtomicU64,
    events_cancelled: AtomicU64,
    delivery_errors: AtomicU64,
}

impl CaptureMetrics {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            events_enqueued: AtomicU64::new(0),
            events_polled: AtomicU64::new(0),
            snapshot_rows: AtomicU64::new(0),
            incremental_windows: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            events_cancelled: AtomicU64::new(0),
            delivery_errors: AtomicU64::new(0),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    #[inline]
    pub fn record_enqueued(&self, count: u64) {
        self.events_enqueued.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_events_enqueued_total",
            "server" => self.server.clone()
        )
        .increment(count);
    }

    #[inline]
    pub fn record_polled(&self, count: u64) {
        self.events_polled.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_events_polled_total",
            "server" => self.server.clone()
        )
        .increment(count);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        metrics::gauge!(
            "rivven_capture_queue_depth",
            "server" => self.server.clone()
        )
        .set(depth as f64);
    }

    /// Record the orchestrator entering a phase.
    pub fn record_phase(&self, phase: &'static str) {
        metrics::gauge!(
            "rivven_capture_phase",
            "server" => self.server.clone(),
            "phase" => phase
        )
        .set(1.0);
    }

    pub fn record_snapshot_rows(&self, table: &str, rows: u64) {
        self.snapshot_rows.fetch_add(rows, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_snapshot_rows_total",
            "server" => self.server.clone(),
            "table" => table.to_string()
        )
        .increment(rows);
    }

    pub fn record_incremental_window(&self) {
        self.incremental_windows.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_incremental_windows_total",
            "server" => self.server.clone()
        )
        .increment(1);
    }

    #[inline]
    pub fn record_delivered(&self, count: u64) {
        self.events_delivered.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_events_delivered_total",
            "server" => self.server.clone()
        )
        .increment(count);
    }

    pub fn record_skipped(&self, count: u64) {
        self.events_skipped.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_events_skipped_total",
            "server" => self.server.clone()
        )
        .increment(count);
    }

    pub fn record_cancelled(&self, count: u64) {
        self.events_cancelled.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_events_cancelled_total",
            "server" => self.server.clone()
        )
        .increment(count);
    }

    pub fn record_delivery_error(&self, code: &'static str) {
        self.delivery_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rivven_capture_delivery_errors_total",
            "server" => self.server.clone(),
            "code" => code
        )
        .increment(1);
    }

    pub fn record_batch_duration(&self, elapsed: Duration) {
        metrics::histogram!(
            "rivven_capture_batch_duration_seconds",
            "server" => self.server.clone()
        )
        .record(elapsed.as_secs_f64());
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> CaptureMetricsSnapshot {
        CaptureMetricsSnapshot {
            events_enqueued: self.events_enqueued.load(Ordering::Relaxed),
            events_polled: self.events_polled.load(Ordering::Relaxed),
            snapshot_rows: self.snapshot_rows.load(Ordering::Relaxed),
            incremental_windows: self.incremental_windows.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            events_cancelled: self.events_cancelled.load(Ordering::Relaxed),
            delivery_errors: self.delivery_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of capture metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CaptureMetricsSnapshot {
    pub events_enqueued: u64,
    pub events_polled: u64,
    pub snapshot_rows: u64,
    pub incremental_windows: u64,
    pub events_delivered: u64,
    pub events_skipped: u64,
    pub events_cancelled: u64,
    pub delivery_errors: u64,
}
