//! Change event representation
//!
//! Events produced by the snapshot engine and, later, by binlog
//! streaming. A [`ChangeEvent`] carries everything the downstream
//! transport needs: the source partition, the replication offset the
//! consumer should persist, a topic, and typed key/value payloads.
//!
//! The offset embeds a snapshot marker derived from the source position
//! at construction time. Exactly one event of a successful snapshot run
//! carries the `last` marker; the buffered last-record queue
//! ([`BufferedLastRecordQueue`](crate::common::BufferedLastRecordQueue))
//! rewrites it in place.

use serde::{Deserialize, Serialize};

/// Offset key carrying the snapshot marker.
pub const OFFSET_SNAPSHOT_KEY: &str = "snapshot";

/// Marker value on the final snapshot record.
pub const OFFSET_SNAPSHOT_LAST: &str = "last";

/// A single field of a record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordField {
    /// Field name (column name for data events)
    pub name: String,
    /// Source type name, e.g. `bigint` or `varchar(255)`
    pub type_name: String,
    /// Whether the field may be null
    pub optional: bool,
}

/// Lightweight schema attached to event keys and values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    /// Schema name, e.g. `inventory.shop.orders.Value`
    pub name: String,
    /// Ordered fields
    pub fields: Vec<RecordField>,
}

impl RecordSchema {
    /// Create a schema with a name and no fields.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field.
    pub fn field(
        mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
        optional: bool,
    ) -> Self {
        self.fields.push(RecordField {
            name: name.into(),
            type_name: type_name.into(),
            optional,
        });
        self
    }
}

/// A change captured from the database, addressed to the downstream
/// transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Identity of the source, e.g. `{"server": "inventory"}`
    pub source_partition: serde_json::Value,
    /// Replication offset to persist once this event is consumed
    pub offset: serde_json::Value,
    /// Destination topic
    pub topic: String,
    /// Typed key (primary-key columns), absent for keyless tables
    pub key: Option<serde_json::Value>,
    /// Schema of the key
    pub key_schema: Option<RecordSchema>,
    /// Event payload
    pub value: serde_json::Value,
    /// Schema of the payload
    pub value_schema: Option<RecordSchema>,
}

impl ChangeEvent {
    /// Build a schema-change event for a DDL statement applied during the
    /// snapshot. `database` is empty for statements that are not scoped
    /// to one database (e.g. the charset `SET` statement).
    pub fn schema_change(
        topic: impl Into<String>,
        database: Option<&str>,
        ddl: &str,
        source_partition: serde_json::Value,
        offset: serde_json::Value,
        ts_ms: i64,
    ) -> Self {
        let db = database.unwrap_or("");
        let change = SchemaChange {
            database: db.to_string(),
            ddl: ddl.to_string(),
            ts_ms,
        };
        Self {
            source_partition,
            offset,
            topic: topic.into(),
            key: Some(serde_json::json!({ "databaseName": db })),
            key_schema: Some(
                RecordSchema::named("SchemaChangeKey").field("databaseName", "varchar", false),
            ),
            value: serde_json::json!({
                "databaseName": change.database,
                "ddl": change.ddl,
                "ts_ms": change.ts_ms,
            }),
            value_schema: Some(
                RecordSchema::named("SchemaChangeValue")
                    .field("databaseName", "varchar", false)
                    .field("ddl", "text", false)
                    .field("ts_ms", "bigint", false),
            ),
        }
    }

    /// Whether this event's offset carries the in-progress snapshot flag
    /// (either `true` or the `last` marker).
    pub fn is_snapshot(&self) -> bool {
        self.offset.get(OFFSET_SNAPSHOT_KEY).is_some()
    }

    /// Whether this is the final record of a snapshot run.
    pub fn is_snapshot_last(&self) -> bool {
        self.offset
            .get(OFFSET_SNAPSHOT_KEY)
            .and_then(|v| v.as_str())
            .map(|v| v == OFFSET_SNAPSHOT_LAST)
            .unwrap_or(false)
    }
}

/// A DDL statement applied to the source schema, as published to the
/// schema-change topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Database the statement applies to; empty when database-agnostic
    pub database: String,
    /// The DDL text
    pub ddl: String,
    /// Wall-clock timestamp of the change, epoch millis
    pub ts_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_schema_builder() {
        let schema = RecordSchema::named("shop.orders.Key")
            .field("id", "int", false)
            .field("note", "varchar(64)", true);

        assert_eq!(schema.name, "shop.orders.Key");
        assert_eq!(schema.fields.len(), 2);
        assert_eq!(schema.fields[0].name, "id");
        assert!(schema.fields[1].optional);
    }

    #[test]
    fn test_schema_change_event_shape() {
        let event = ChangeEvent::schema_change(
            "inventory",
            Some("shop"),
            "CREATE DATABASE `shop`",
            serde_json::json!({"server": "inventory"}),
            serde_json::json!({"file": "binlog.000003", "pos": 154, "snapshot": true}),
            1_700_000_000_000,
        );

        assert_eq!(event.topic, "inventory");
        assert_eq!(event.value["ddl"], "CREATE DATABASE `shop`");
        assert!(event.is_snapshot());
        assert!(!event.is_snapshot_last());
        assert_eq!(event.key.unwrap()["databaseName"], "shop");
    }

    #[test]
    fn test_snapshot_markers() {
        let mut event = ChangeEvent::schema_change(
            "t",
            None,
            "SET x=y",
            serde_json::json!({}),
            serde_json::json!({"file": "b.1", "pos": 4}),
            0,
        );
        assert!(!event.is_snapshot());

        event.offset[OFFSET_SNAPSHOT_KEY] = serde_json::json!(OFFSET_SNAPSHOT_LAST);
        assert!(event.is_snapshot());
        assert!(event.is_snapshot_last());
    }
}
