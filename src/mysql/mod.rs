//! MySQL snapshot engine
//!
//! The pieces the snapshot orchestrator drives:
//!
//! - [`connection`] — the session seam ([`SnapshotConnection`]) with the
//!   `mysql_async`-backed implementation and an in-memory fake
//! - [`probe`] — read-only server metadata queries
//! - [`schema`] — the in-memory table catalog rebuilt from DDL
//! - [`source_info`] — binlog position and snapshot markers
//! - [`records`] — row-to-event construction
//! - [`snapshot`] — the ten-step snapshot protocol
//! - [`reader`] — start/poll/stop lifecycle around the snapshot worker

pub mod connection;
pub mod probe;
pub mod records;
pub mod schema;
mod snapshot;
pub mod reader;
pub mod source_info;

pub use connection::{MemoryConnection, MySqlConnection, RowStream, SnapshotConnection, SqlRow, SqlValue};
pub use reader::{ReaderState, SnapshotReader};
pub use records::{RecordMakers, RecordsForTable};
pub use schema::{Column, MySqlSchema, Table, TableId};
pub use source_info::{BinlogCoordinate, SnapshotMarker, SourceInfo};
