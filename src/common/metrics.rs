//! Snapshot observability
//!
//! Counters and timers for the snapshot phases, kept in atomics for
//! lock-free updates and mirrored to the `metrics` crate facade so any
//! installed recorder (Prometheus, statsd, ...) sees them.
//!
//! # Usage
//!
//! ```rust
//! use rowstream::common::SnapshotMetrics;
//!
//! let metrics = SnapshotMetrics::new("inventory");
//! metrics.snapshot_started();
//! metrics.record_rows(100);
//! let snap = metrics.snapshot();
//! assert_eq!(snap.rows_scanned, 100);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Metrics for one snapshot run.
#[derive(Debug)]
pub struct SnapshotMetrics {
    /// Logical server name, used as the metric label
    server_name: String,

    running: AtomicBool,
    completed: AtomicBool,
    aborted: AtomicBool,

    /// Tables selected for the scan
    table_count: AtomicU64,
    /// Tables fully scanned so far
    completed_tables: AtomicU64,
    /// Data rows recorded so far
    rows_scanned: AtomicU64,
    /// Schema-change events emitted
    ddl_events: AtomicU64,

    /// Whether the global read lock is currently held
    lock_held: AtomicBool,
    /// Total time the global read lock was held, millis
    lock_held_ms: AtomicU64,
}

impl SnapshotMetrics {
    /// Create a collector labeled with the logical server name.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            running: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            table_count: AtomicU64::new(0),
            completed_tables: AtomicU64::new(0),
            rows_scanned: AtomicU64::new(0),
            ddl_events: AtomicU64::new(0),
            lock_held: AtomicBool::new(false),
            lock_held_ms: AtomicU64::new(0),
        }
    }

    /// The snapshot protocol began.
    pub fn snapshot_started(&self) {
        self.running.store(true, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_starts_total",
            "server" => self.server_name.clone()
        )
        .increment(1);
    }

    /// The snapshot committed.
    pub fn snapshot_completed(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.completed.store(true, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_completions_total",
            "server" => self.server_name.clone()
        )
        .increment(1);
    }

    /// The snapshot rolled back.
    pub fn snapshot_aborted(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.aborted.store(true, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_aborts_total",
            "server" => self.server_name.clone()
        )
        .increment(1);
    }

    /// Number of tables selected for scanning.
    pub fn set_table_count(&self, count: u64) {
        self.table_count.store(count, Ordering::Relaxed);
        metrics::gauge!(
            "rowstream_snapshot_tables",
            "server" => self.server_name.clone()
        )
        .set(count as f64);
    }

    /// One table finished scanning.
    pub fn table_completed(&self) {
        self.completed_tables.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_tables_completed_total",
            "server" => self.server_name.clone()
        )
        .increment(1);
    }

    /// `count` data rows were recorded.
    pub fn record_rows(&self, count: u64) {
        self.rows_scanned.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_rows_total",
            "server" => self.server_name.clone()
        )
        .increment(count);
    }

    /// One schema-change event was emitted.
    pub fn record_ddl(&self) {
        self.ddl_events.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "rowstream_snapshot_ddl_total",
            "server" => self.server_name.clone()
        )
        .increment(1);
    }

    /// The global read lock was acquired.
    pub fn global_lock_acquired(&self) {
        self.lock_held.store(true, Ordering::Relaxed);
        metrics::gauge!(
            "rowstream_snapshot_lock_held",
            "server" => self.server_name.clone()
        )
        .set(1.0);
    }

    /// The global read lock was released after being held for `held`.
    pub fn global_lock_released(&self, held: Duration) {
        self.lock_held.store(false, Ordering::Relaxed);
        self.lock_held_ms
            .fetch_add(held.as_millis() as u64, Ordering::Relaxed);
        metrics::gauge!(
            "rowstream_snapshot_lock_held",
            "server" => self.server_name.clone()
        )
        .set(0.0);
        metrics::histogram!(
            "rowstream_snapshot_lock_seconds",
            "server" => self.server_name.clone()
        )
        .record(held.as_secs_f64());
    }

    /// Readable view of the counters.
    pub fn snapshot(&self) -> SnapshotMetricsSnapshot {
        SnapshotMetricsSnapshot {
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            table_count: self.table_count.load(Ordering::Relaxed),
            completed_tables: self.completed_tables.load(Ordering::Relaxed),
            rows_scanned: self.rows_scanned.load(Ordering::Relaxed),
            ddl_events: self.ddl_events.load(Ordering::Relaxed),
            lock_held: self.lock_held.load(Ordering::Relaxed),
            lock_held_ms: self.lock_held_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`SnapshotMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetricsSnapshot {
    pub running: bool,
    pub completed: bool,
    pub aborted: bool,
    pub table_count: u64,
    pub completed_tables: u64,
    pub rows_scanned: u64,
    pub ddl_events: u64,
    pub lock_held: bool,
    pub lock_held_ms: u64,
}
