//! Record construction for snapshot rows
//!
//! [`RecordMakers`] binds the logical server name and the compiled
//! filters; [`RecordMakers::for_table`] pre-computes everything needed to
//! turn raw rows of one table into [`ChangeEvent`]s — topic, schemas,
//! key column positions, the filtered value columns, and the offset all
//! snapshot records of the run share — and hands back a
//! [`RecordsForTable`] bound to the buffered queue.
//!
//! `read` and `create` differ only in the operation code stamped on the
//! envelope. Both may block on sink backpressure and surface
//! [`CdcError::Cancelled`](crate::common::CdcError) when the reader is
//! stopped while blocked.

use crate::common::{
    BufferedLastRecordQueue, ChangeEvent, Filters, RecordSchema, Result, SnapshotRecordKind,
};
use crate::mysql::connection::SqlRow;
use crate::mysql::schema::Table;
use crate::mysql::source_info::SourceInfo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Factory for per-table record makers.
pub struct RecordMakers {
    server_name: String,
    filters: Arc<Filters>,
}

impl RecordMakers {
    /// Create a factory for the named server.
    pub fn new(server_name: impl Into<String>, filters: Arc<Filters>) -> Self {
        Self {
            server_name: server_name.into(),
            filters,
        }
    }

    /// Build a maker for one table, bound to the buffered queue.
    ///
    /// The offset attached to every record is derived from `source` at
    /// this moment; during a snapshot that is the pinned binlog
    /// coordinate plus the in-progress marker.
    pub fn for_table<'q>(
        &self,
        table: &Table,
        source: &SourceInfo,
        queue: &'q mut BufferedLastRecordQueue,
        cancel: CancellationToken,
    ) -> RecordsForTable<'q> {
        let catalog = table.id.catalog();
        let name = table.id.table();
        let topic = format!("{}.{}.{}", self.server_name, catalog, name);

        let key_columns: Vec<(usize, String)> = table
            .primary_key
            .iter()
            .filter_map(|pk| table.column_index(pk).map(|idx| (idx, pk.clone())))
            .collect();

        let value_columns: Vec<(usize, String)> = table
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| self.filters.column_filter(catalog, name, &c.name))
            .map(|(idx, c)| (idx, c.name.clone()))
            .collect();

        let mut key_schema = RecordSchema::named(format!("{topic}.Key"));
        for (idx, pk) in &key_columns {
            let column = &table.columns[*idx];
            key_schema = key_schema.field(pk.clone(), column.type_name.clone(), false);
        }
        let mut value_schema = RecordSchema::named(format!("{topic}.Value"));
        for (idx, name) in &value_columns {
            let column = &table.columns[*idx];
            value_schema =
                value_schema.field(name.clone(), column.type_name.clone(), column.nullable);
        }

        // Source metadata embedded in every envelope: identity plus the
        // pinned position.
        let mut source_meta = source.offset();
        if let Some(map) = source_meta.as_object_mut() {
            map.insert("name".to_string(), serde_json::json!(self.server_name));
            map.insert("db".to_string(), serde_json::json!(catalog));
            map.insert("table".to_string(), serde_json::json!(name));
        }

        RecordsForTable {
            topic,
            partition: source.partition(),
            offset: source.offset(),
            source_meta,
            key_columns,
            value_columns,
            key_schema,
            value_schema,
            queue,
            cancel,
        }
    }
}

/// Maker of change events for one table's rows.
pub struct RecordsForTable<'q> {
    topic: String,
    partition: serde_json::Value,
    offset: serde_json::Value,
    source_meta: serde_json::Value,
    key_columns: Vec<(usize, String)>,
    value_columns: Vec<(usize, String)>,
    key_schema: RecordSchema,
    value_schema: RecordSchema,
    queue: &'q mut BufferedLastRecordQueue,
    cancel: CancellationToken,
}

impl RecordsForTable<'_> {
    /// Record a row as a `READ` event.
    pub async fn read(&mut self, row: &SqlRow, ts_ms: i64) -> Result<()> {
        self.record(row, SnapshotRecordKind::Read, ts_ms).await
    }

    /// Record a row as a `CREATE` event.
    pub async fn create(&mut self, row: &SqlRow, ts_ms: i64) -> Result<()> {
        self.record(row, SnapshotRecordKind::Create, ts_ms).await
    }

    async fn record(&mut self, row: &SqlRow, kind: SnapshotRecordKind, ts_ms: i64) -> Result<()> {
        let key = if self.key_columns.is_empty() {
            None
        } else {
            let mut map = serde_json::Map::new();
            for (idx, name) in &self.key_columns {
                let value = row
                    .get(*idx)
                    .map(|v| v.to_json())
                    .unwrap_or(serde_json::Value::Null);
                map.insert(name.clone(), value);
            }
            Some(serde_json::Value::Object(map))
        };

        let mut after = serde_json::Map::new();
        for (idx, name) in &self.value_columns {
            let value = row
                .get(*idx)
                .map(|v| v.to_json())
                .unwrap_or(serde_json::Value::Null);
            after.insert(name.clone(), value);
        }

        let event = ChangeEvent {
            source_partition: self.partition.clone(),
            offset: self.offset.clone(),
            topic: self.topic.clone(),
            key,
            key_schema: Some(self.key_schema.clone()),
            value: serde_json::json!({
                "op": kind.op_code(),
                "before": serde_json::Value::Null,
                "after": serde_json::Value::Object(after),
                "source": self.source_meta.clone(),
                "ts_ms": ts_ms,
            }),
            value_schema: Some(self.value_schema.clone()),
        };

        self.queue.enqueue(event, &self.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::CdcConfig;
    use crate::mysql::connection::SqlValue;
    use crate::mysql::schema::{Column, TableId};
    use tokio::sync::mpsc;

    fn table() -> Table {
        Table {
            id: TableId::new("shop", "orders"),
            columns: vec![
                Column {
                    name: "id".to_string(),
                    type_name: "int".to_string(),
                    nullable: false,
                },
                Column {
                    name: "note".to_string(),
                    type_name: "varchar(64)".to_string(),
                    nullable: true,
                },
                Column {
                    name: "secret".to_string(),
                    type_name: "varchar(64)".to_string(),
                    nullable: true,
                },
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    fn makers(config: &CdcConfig) -> RecordMakers {
        RecordMakers::new("inventory", Arc::new(Filters::new(config).unwrap()))
    }

    fn source() -> SourceInfo {
        let mut source = SourceInfo::new("inventory");
        source.set_binlog_start_point("binlog.000003", 154);
        source.start_snapshot();
        source
    }

    #[tokio::test]
    async fn test_read_event_shape() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut queue = BufferedLastRecordQueue::new(tx);
        let config = CdcConfig::default();
        let makers = makers(&config);
        let source = source();
        let cancel = CancellationToken::new();

        let mut recorder = makers.for_table(&table(), &source, &mut queue, cancel.clone());
        let row: SqlRow = vec![1i64.into(), "first".into(), "s3cret".into()];
        recorder.read(&row, 1_700_000_000_000).await.unwrap();
        recorder
            .read(&vec![2i64.into(), SqlValue::Null, SqlValue::Null], 1_700_000_000_000)
            .await
            .unwrap();
        drop(recorder);
        queue.flush(|ev| ev, &cancel).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "inventory.shop.orders");
        assert_eq!(first.key.as_ref().unwrap()["id"], 1);
        assert_eq!(first.value["op"], "r");
        assert_eq!(first.value["after"]["note"], "first");
        assert_eq!(first.value["source"]["db"], "shop");
        assert_eq!(first.value["ts_ms"], 1_700_000_000_000i64);
        assert_eq!(first.offset["file"], "binlog.000003");
        assert_eq!(first.offset["snapshot"], true);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.value["after"]["note"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_create_event_op_code() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut queue = BufferedLastRecordQueue::new(tx);
        let config = CdcConfig::default();
        let makers = makers(&config);
        let source = source();
        let cancel = CancellationToken::new();

        let mut recorder = makers.for_table(&table(), &source, &mut queue, cancel.clone());
        recorder
            .create(&vec![7i64.into(), "x".into(), "y".into()], 0)
            .await
            .unwrap();
        drop(recorder);
        queue.flush(|ev| ev, &cancel).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.value["op"], "c");
    }

    #[tokio::test]
    async fn test_column_filter_applies_to_values_not_keys() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut queue = BufferedLastRecordQueue::new(tx);
        let config = CdcConfig::default().exclude_column("shop\\.orders\\.secret");
        let makers = makers(&config);
        let source = source();
        let cancel = CancellationToken::new();

        let mut recorder = makers.for_table(&table(), &source, &mut queue, cancel.clone());
        recorder
            .read(&vec![1i64.into(), "n".into(), "classified".into()], 0)
            .await
            .unwrap();
        drop(recorder);
        queue.flush(|ev| ev, &cancel).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(event.value["after"].get("secret").is_none());
        assert!(event.value["after"].get("note").is_some());
        assert_eq!(event.key.as_ref().unwrap()["id"], 1);

        let value_schema = event.value_schema.as_ref().unwrap();
        assert!(value_schema.fields.iter().all(|f| f.name != "secret"));
    }

    #[tokio::test]
    async fn test_keyless_table_has_no_key() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut queue = BufferedLastRecordQueue::new(tx);
        let config = CdcConfig::default();
        let makers = makers(&config);
        let source = source();
        let cancel = CancellationToken::new();

        let mut keyless = table();
        keyless.primary_key.clear();

        let mut recorder = makers.for_table(&keyless, &source, &mut queue, cancel.clone());
        recorder
            .read(&vec![1i64.into(), "n".into(), "s".into()], 0)
            .await
            .unwrap();
        drop(recorder);
        queue.flush(|ev| ev, &cancel).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert!(event.key.is_none());
    }
}
