//! Database-agnostic building blocks
//!
//! - [`CdcError`] / [`Result`] — the connector error taxonomy
//! - [`ChangeEvent`] — events addressed to the downstream transport
//! - [`CdcConfig`] — configuration surface and validation
//! - [`Filters`] — compiled include/exclude predicates
//! - [`BufferedLastRecordQueue`] — FIFO with one element of look-ahead,
//!   enabling the end-of-snapshot offset rewrite
//! - [`SnapshotMetrics`] — counters and timers for the snapshot phases

mod config;
mod error;
pub mod event;
mod filter;
mod metrics;
mod queue;

pub use config::{CdcConfig, SnapshotMode, SnapshotRecordKind};
pub use error::{CdcError, Result};
pub use event::{ChangeEvent, RecordField, RecordSchema, SchemaChange};
pub use filter::{is_builtin_database, Filters, BUILTIN_DATABASES};
pub use metrics::{SnapshotMetrics, SnapshotMetricsSnapshot};
pub use queue::BufferedLastRecordQueue;
