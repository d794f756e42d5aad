//! Connector configuration
//!
//! All knobs the snapshot engine consumes, with the defaults the
//! connector has always shipped: a random replication server id in
//! [5400, 6400), minimal locking on, a 2048-event queue drained in
//! 1024-event batches, and tables above 1000 estimated rows read through
//! a streaming cursor.
//!
//! # Example
//!
//! ```rust
//! use rowstream::common::{CdcConfig, SnapshotMode};
//!
//! let config = CdcConfig::new("localhost", "repl", "inventory")
//!     .with_password("secret")
//!     .with_snapshot_mode(SnapshotMode::Initial)
//!     .include_database("shop");
//! assert!(config.validate().is_ok());
//! ```

use crate::common::{CdcError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the connector takes a snapshot, and whether streaming follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Snapshot only if no prior offset exists, then stream.
    WhenNeeded,

    /// Snapshot on first start, then stream. The default.
    #[default]
    Initial,

    /// Snapshot and stop; no streaming afterwards.
    InitialOnly,

    /// Capture schema only; no data events, then stream.
    SchemaOnly,

    /// Never snapshot; stream from the current position.
    Never,
}

impl SnapshotMode {
    /// Whether this mode runs the snapshot engine at all.
    pub fn activates_snapshot(&self) -> bool {
        !matches!(self, Self::Never)
    }

    /// Whether table contents are dumped (step 8 of the protocol).
    pub fn includes_data(&self) -> bool {
        matches!(self, Self::WhenNeeded | Self::Initial | Self::InitialOnly)
    }

    /// Whether binlog streaming follows the snapshot.
    pub fn should_stream(&self) -> bool {
        !matches!(self, Self::InitialOnly)
    }

    /// Parse from the configuration surface string.
    pub fn from_str_value(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "when_needed" => Some(Self::WhenNeeded),
            "initial" => Some(Self::Initial),
            "initial_only" => Some(Self::InitialOnly),
            "schema_only" => Some(Self::SchemaOnly),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

/// Which event kind snapshot rows are recorded as.
///
/// The two constructors differ only in the operation code stamped on the
/// event envelope; some downstreams want snapshot rows to look like
/// inserts, others want them marked as reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRecordKind {
    /// Emit rows as `READ` events. The default.
    #[default]
    Read,
    /// Emit rows as `CREATE` (insert) events.
    Create,
}

impl SnapshotRecordKind {
    /// Operation code used in event envelopes.
    pub fn op_code(&self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Create => "c",
        }
    }
}

/// Connector configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct CdcConfig {
    /// MySQL host
    pub hostname: String,
    /// MySQL port
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Logical name of this server; topic prefix and source partition key
    pub server_name: String,
    /// Replication server id; must be unique among all replicas.
    /// Defaults to a random value in [5400, 6400).
    pub server_id: u32,
    /// When to snapshot
    pub snapshot_mode: SnapshotMode,
    /// Release the global read lock as soon as the binlog coordinate and
    /// schema are captured, letting the MVCC view carry the rest of the
    /// scan. Disable for engines without MVCC.
    pub snapshot_minimal_locks: bool,
    /// Whether snapshot rows become `READ` or `CREATE` events
    pub snapshot_record_kind: SnapshotRecordKind,
    /// Tables whose estimated row count exceeds this use a streaming
    /// cursor instead of a fully-buffered result set. 0 streams always.
    pub min_row_count_to_stream_results: u64,
    /// Capacity of the event queue between the snapshot worker and
    /// `poll()`. Must exceed `max_batch_size`.
    pub max_queue_size: usize,
    /// Maximum number of events returned by one `poll()`
    pub max_batch_size: usize,
    /// How long `poll()` blocks waiting for the first event
    pub poll_interval: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Databases to capture (regex list; exclusive with the exclude list)
    pub database_include_list: Vec<String>,
    /// Databases to skip
    pub database_exclude_list: Vec<String>,
    /// Tables to capture, as `db\.table` regexes
    pub table_include_list: Vec<String>,
    /// Tables to skip
    pub table_exclude_list: Vec<String>,
    /// Columns to drop from event values, as `db\.table\.column` regexes
    pub column_exclude_list: Vec<String>,
    /// GTID source UUIDs to keep
    pub gtid_source_include_list: Vec<String>,
    /// GTID source UUIDs to drop
    pub gtid_source_exclude_list: Vec<String>,
    /// Publish DDL events to the schema-change topic
    pub include_schema_changes: bool,
    /// Skip `mysql`, `information_schema`, `performance_schema`, `sys`
    pub ignore_builtin_databases: bool,
}

impl std::fmt::Debug for CdcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_name", &self.server_name)
            .field("server_id", &self.server_id)
            .field("snapshot_mode", &self.snapshot_mode)
            .field("snapshot_minimal_locks", &self.snapshot_minimal_locks)
            .field("snapshot_record_kind", &self.snapshot_record_kind)
            .field(
                "min_row_count_to_stream_results",
                &self.min_row_count_to_stream_results,
            )
            .field("max_queue_size", &self.max_queue_size)
            .field("max_batch_size", &self.max_batch_size)
            .field("database_include_list", &self.database_include_list)
            .field("database_exclude_list", &self.database_exclude_list)
            .field("table_include_list", &self.table_include_list)
            .field("table_exclude_list", &self.table_exclude_list)
            .field("include_schema_changes", &self.include_schema_changes)
            .finish()
    }
}

impl Default for CdcConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_name: "mysql".to_string(),
            server_id: random_server_id(),
            snapshot_mode: SnapshotMode::default(),
            snapshot_minimal_locks: true,
            snapshot_record_kind: SnapshotRecordKind::default(),
            min_row_count_to_stream_results: 1_000,
            max_queue_size: 2_048,
            max_batch_size: 1_024,
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            database_include_list: vec![],
            database_exclude_list: vec![],
            table_include_list: vec![],
            table_exclude_list: vec![],
            column_exclude_list: vec![],
            gtid_source_include_list: vec![],
            gtid_source_exclude_list: vec![],
            include_schema_changes: true,
            ignore_builtin_databases: true,
        }
    }
}

/// Pick a replication server id in [5400, 6400).
fn random_server_id() -> u32 {
    rand::thread_rng().gen_range(5400..6400)
}

impl CdcConfig {
    /// Create a configuration for the given host, user, and logical
    /// server name.
    pub fn new(
        hostname: impl Into<String>,
        user: impl Into<String>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            user: user.into(),
            server_name: server_name.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn with_minimal_locks(mut self, minimal: bool) -> Self {
        self.snapshot_minimal_locks = minimal;
        self
    }

    pub fn with_snapshot_record_kind(mut self, kind: SnapshotRecordKind) -> Self {
        self.snapshot_record_kind = kind;
        self
    }

    pub fn with_queue_sizes(mut self, max_queue_size: usize, max_batch_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_min_row_count_to_stream_results(mut self, rows: u64) -> Self {
        self.min_row_count_to_stream_results = rows;
        self
    }

    pub fn include_database(mut self, pattern: impl Into<String>) -> Self {
        self.database_include_list.push(pattern.into());
        self
    }

    pub fn exclude_database(mut self, pattern: impl Into<String>) -> Self {
        self.database_exclude_list.push(pattern.into());
        self
    }

    pub fn include_table(mut self, pattern: impl Into<String>) -> Self {
        self.table_include_list.push(pattern.into());
        self
    }

    pub fn exclude_table(mut self, pattern: impl Into<String>) -> Self {
        self.table_exclude_list.push(pattern.into());
        self
    }

    pub fn exclude_column(mut self, pattern: impl Into<String>) -> Self {
        self.column_exclude_list.push(pattern.into());
        self
    }

    pub fn with_schema_changes(mut self, include: bool) -> Self {
        self.include_schema_changes = include;
        self
    }

    /// Check the configuration for conflicts. Side-effect free; every
    /// violation is a [`CdcError::Config`].
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(CdcError::config("hostname must not be empty"));
        }
        if self.user.is_empty() {
            return Err(CdcError::config("user must not be empty"));
        }
        if self.server_name.is_empty() {
            return Err(CdcError::config("server name must not be empty"));
        }
        if self.server_id == 0 {
            return Err(CdcError::config("server id must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(CdcError::config("max batch size must be positive"));
        }
        if self.max_queue_size <= self.max_batch_size {
            return Err(CdcError::config(format!(
                "max queue size ({}) must be larger than max batch size ({})",
                self.max_queue_size, self.max_batch_size
            )));
        }
        if !self.database_include_list.is_empty() && !self.database_exclude_list.is_empty() {
            return Err(CdcError::config(
                "database include and exclude lists are mutually exclusive",
            ));
        }
        if !self.table_include_list.is_empty() && !self.table_exclude_list.is_empty() {
            return Err(CdcError::config(
                "table include and exclude lists are mutually exclusive",
            ));
        }
        if !self.gtid_source_include_list.is_empty() && !self.gtid_source_exclude_list.is_empty() {
            return Err(CdcError::config(
                "GTID source include and exclude lists are mutually exclusive",
            ));
        }
        Ok(())
    }
}
