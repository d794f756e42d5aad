//! # rowstream - MySQL change data capture
//!
//! A connector that tails a MySQL server and publishes a consistent,
//! ordered stream of row-level change events plus schema-change events.
//! This crate implements the snapshot side: a consistent point-in-time
//! dump of the selected tables that pins the exact binlog coordinate
//! binlog streaming resumes from, so nothing is lost or duplicated at
//! the seam between the two phases.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   SnapshotReader                         │
//! │        start() / poll() / stop() lifecycle               │
//! ├──────────────────────────────────────────────────────────┤
//! │                 SnapshotOrchestrator                     │
//! │  ten-step protocol on one dedicated worker:              │
//! │  REPEATABLE READ txn → global read lock → SHOW MASTER    │
//! │  STATUS → schema rebuild → early unlock → table scan     │
//! │  → tail-offset rewrite → COMMIT                          │
//! ├───────────────┬──────────────┬───────────────────────────┤
//! │  ServerProbe  │ MySqlSchema  │ RecordMakers              │
//! │  metadata     │ DDL replay   │ rows → ChangeEvents       │
//! ├───────────────┴──────────────┴───────────────────────────┤
//! │     BufferedLastRecordQueue → bounded event channel      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use rowstream::common::{CdcConfig, SnapshotMode};
//! use rowstream::mysql::SnapshotReader;
//!
//! # async fn example() -> rowstream::common::Result<()> {
//! let config = CdcConfig::new("localhost", "repl", "inventory")
//!     .with_password("secret")
//!     .with_snapshot_mode(SnapshotMode::Initial)
//!     .include_database("shop");
//!
//! let mut reader = SnapshotReader::connect(config).await?;
//! reader.start()?;
//! loop {
//!     let batch = reader.poll().await?;
//!     if batch.is_empty() && !matches!(reader.state(), rowstream::mysql::ReaderState::Running) {
//!         break;
//!     }
//!     for event in batch {
//!         println!("{} -> {}", event.topic, event.value);
//!     }
//! }
//! if let Some(source) = reader.completed_source_info() {
//!     println!("streaming starts at {:?}", source.binlog_coordinate());
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod mysql;

pub use common::{
    BufferedLastRecordQueue, CdcConfig, CdcError, ChangeEvent, Filters, RecordSchema, Result,
    SchemaChange, SnapshotMetrics, SnapshotMode, SnapshotRecordKind,
};
pub use mysql::{
    BinlogCoordinate, MySqlSchema, ReaderState, SnapshotMarker, SnapshotReader, SourceInfo,
    Table, TableId,
};
