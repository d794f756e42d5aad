//! Source position tracking
//!
//! [`SourceInfo`] is the mutable progress record for one connector run:
//! which binlog coordinate events correspond to, and where in the
//! snapshot lifecycle the run is. It is owned and mutated exclusively by
//! the snapshot orchestrator until the snapshot completes, then handed to
//! the streaming subsystem as its starting point.

use serde::{Deserialize, Serialize};

use crate::common::event::{OFFSET_SNAPSHOT_KEY, OFFSET_SNAPSHOT_LAST};

/// Key of the server name in source partitions.
pub const SERVER_PARTITION_KEY: &str = "server";

/// A logical position in the server's replication log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinate {
    /// Binlog file name, e.g. `binlog.000003`
    pub file: String,
    /// Byte offset within the file
    pub position: u64,
    /// Executed GTID set, when the server reports one
    pub gtid_set: Option<String>,
}

/// Where in the snapshot lifecycle the current position sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMarker {
    /// No snapshot has started.
    #[default]
    None,
    /// A snapshot is producing records.
    InProgress,
    /// The next record is the final snapshot record.
    Last,
    /// The snapshot finished; subsequent records come from streaming.
    Complete,
}

/// Progress record for one connector run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    server_name: String,
    binlog_file: String,
    binlog_position: u64,
    gtid_set: Option<String>,
    marker: SnapshotMarker,
}

impl SourceInfo {
    /// Create a fresh record for the named server.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            binlog_file: String::new(),
            binlog_position: 0,
            gtid_set: None,
            marker: SnapshotMarker::None,
        }
    }

    /// Logical server name.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Record the binlog coordinate all snapshot records will carry.
    pub fn set_binlog_start_point(&mut self, file: impl Into<String>, position: u64) {
        self.binlog_file = file.into();
        self.binlog_position = position;
    }

    /// Record the executed GTID set, ignoring blank values.
    pub fn set_completed_gtid_set(&mut self, gtid_set: Option<String>) {
        self.gtid_set = gtid_set.filter(|g| !g.trim().is_empty());
    }

    /// Enter the in-progress snapshot state.
    pub fn start_snapshot(&mut self) {
        self.marker = SnapshotMarker::InProgress;
    }

    /// Mark that the next record produced is the final snapshot record.
    pub fn mark_last_snapshot(&mut self) {
        self.marker = SnapshotMarker::Last;
    }

    /// Leave snapshot mode; subsequent offsets carry no snapshot flag.
    pub fn complete_snapshot(&mut self) {
        self.marker = SnapshotMarker::Complete;
    }

    /// Current snapshot marker.
    pub fn snapshot_marker(&self) -> SnapshotMarker {
        self.marker
    }

    /// Whether a snapshot is underway.
    pub fn is_snapshot_in_progress(&self) -> bool {
        matches!(
            self.marker,
            SnapshotMarker::InProgress | SnapshotMarker::Last
        )
    }

    /// The pinned coordinate, if one was captured.
    pub fn binlog_coordinate(&self) -> Option<BinlogCoordinate> {
        if self.binlog_file.is_empty() {
            return None;
        }
        Some(BinlogCoordinate {
            file: self.binlog_file.clone(),
            position: self.binlog_position,
            gtid_set: self.gtid_set.clone(),
        })
    }

    /// Source partition identifying this server to the downstream
    /// transport.
    pub fn partition(&self) -> serde_json::Value {
        serde_json::json!({ SERVER_PARTITION_KEY: self.server_name })
    }

    /// The offset consumers persist: `{file, pos, gtids?, snapshot?}`.
    ///
    /// The snapshot flag is `true` while the snapshot runs, the `last`
    /// marker on the final snapshot record, and absent otherwise; its
    /// presence is what tells a restarting consumer whether an
    /// unfinished snapshot must be redone.
    pub fn offset(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("file".to_string(), serde_json::json!(self.binlog_file));
        map.insert("pos".to_string(), serde_json::json!(self.binlog_position));
        if let Some(gtids) = &self.gtid_set {
            map.insert("gtids".to_string(), serde_json::json!(gtids));
        }
        match self.marker {
            SnapshotMarker::InProgress => {
                map.insert(OFFSET_SNAPSHOT_KEY.to_string(), serde_json::json!(true));
            }
            SnapshotMarker::Last => {
                map.insert(
                    OFFSET_SNAPSHOT_KEY.to_string(),
                    serde_json::json!(OFFSET_SNAPSHOT_LAST),
                );
            }
            SnapshotMarker::None | SnapshotMarker::Complete => {}
        }
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_without_snapshot() {
        let mut source = SourceInfo::new("inventory");
        source.set_binlog_start_point("binlog.000003", 154);

        let offset = source.offset();
        assert_eq!(offset["file"], "binlog.000003");
        assert_eq!(offset["pos"], 154);
        assert!(offset.get(OFFSET_SNAPSHOT_KEY).is_none());
        assert!(offset.get("gtids").is_none());
    }

    #[test]
    fn test_offset_marker_progression() {
        let mut source = SourceInfo::new("inventory");
        source.set_binlog_start_point("binlog.000003", 154);

        source.start_snapshot();
        assert_eq!(source.offset()[OFFSET_SNAPSHOT_KEY], true);
        assert!(source.is_snapshot_in_progress());

        source.mark_last_snapshot();
        assert_eq!(source.offset()[OFFSET_SNAPSHOT_KEY], OFFSET_SNAPSHOT_LAST);

        source.complete_snapshot();
        assert!(source.offset().get(OFFSET_SNAPSHOT_KEY).is_none());
        assert!(!source.is_snapshot_in_progress());
    }

    #[test]
    fn test_blank_gtid_set_dropped() {
        let mut source = SourceInfo::new("inventory");
        source.set_completed_gtid_set(Some("  ".to_string()));
        assert!(source.offset().get("gtids").is_none());

        source.set_completed_gtid_set(Some("36eb5b0a:1-42".to_string()));
        assert_eq!(source.offset()["gtids"], "36eb5b0a:1-42");
    }

    #[test]
    fn test_binlog_coordinate() {
        let mut source = SourceInfo::new("inventory");
        assert!(source.binlog_coordinate().is_none());

        source.set_binlog_start_point("binlog.000007", 4);
        source.set_completed_gtid_set(Some("abc:1-9".to_string()));
        let coord = source.binlog_coordinate().unwrap();
        assert_eq!(coord.file, "binlog.000007");
        assert_eq!(coord.position, 4);
        assert_eq!(coord.gtid_set.as_deref(), Some("abc:1-9"));
    }

    #[test]
    fn test_partition() {
        let source = SourceInfo::new("inventory");
        assert_eq!(
            source.partition(),
            serde_json::json!({"server": "inventory"})
        );
    }
}
