//! Snapshot orchestrator
//!
//! Performs a consistent snapshot of a MySQL server using the same logic
//! as the `mysqldump` utility: one REPEATABLE READ transaction opened
//! `WITH CONSISTENT SNAPSHOT`, a global read lock held just long enough
//! to pin the binlog coordinate and capture schemas, then a scan of every
//! selected table under the pinned MVCC view.
//!
//! The ten-step protocol is normative; deviations break the consistency
//! guarantee:
//!
//! 0. disable autocommit, set REPEATABLE READ
//! 1. `START TRANSACTION WITH CONSISTENT SNAPSHOT`
//! 2. `FLUSH TABLES WITH READ LOCK`
//! 3. `SHOW MASTER STATUS` into [`SourceInfo`], marker `in progress`
//! 4. `SHOW DATABASES`, filtered
//! 5. `SHOW TABLES IN` each database; unreadable databases are skipped
//!    with a warning
//! 6. rebuild the schema model through synthetic DDL, emitting
//!    schema-change events
//! 7. `UNLOCK TABLES` early when minimal locking is configured
//! 8. scan each table with `SELECT *`, streaming large tables, checking
//!    cancellation every 100 rows
//! 9. `UNLOCK TABLES` in cleanup if still locked (idempotent)
//! 10. on success mark the source `last`, flush the buffered tail record
//!     with the rewritten offset, `COMMIT`; otherwise `ROLLBACK`
//!
//! Cancellation is cooperative: a token checked at every step boundary,
//! between tables, every 100 rows, and raced against blocked sink sends.

use crate::common::{
    BufferedLastRecordQueue, CdcConfig, CdcError, ChangeEvent, Filters, Result, SnapshotMetrics,
    SnapshotRecordKind,
};
use crate::mysql::connection::{SnapshotConnection, SqlValue};
use crate::mysql::probe;
use crate::mysql::records::RecordMakers;
use crate::mysql::schema::{quote_ident, quote_table, MySqlSchema, TableId};
use crate::mysql::source_info::SourceInfo;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Rows between cooperative cancellation checks.
const CANCEL_CHECK_ROWS: u64 = 100;

/// Rows between progress metrics and log lines.
const PROGRESS_ROWS: u64 = 10_000;

/// Server-side resources acquired by the protocol. The cleanup path
/// consults and clears these flags so releasing twice never issues a
/// second `UNLOCK TABLES` or `ROLLBACK`.
struct ProtocolState {
    locked: bool,
    txn_open: bool,
    lock_acquired_at: Option<Instant>,
}

/// Runs the ten-step snapshot protocol on a dedicated worker.
pub(crate) struct SnapshotOrchestrator<C: SnapshotConnection> {
    config: Arc<CdcConfig>,
    filters: Arc<Filters>,
    schema: Arc<RwLock<MySqlSchema>>,
    conn: C,
    source: SourceInfo,
    sink: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
    metrics: Arc<SnapshotMetrics>,
}

impl<C: SnapshotConnection> SnapshotOrchestrator<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<CdcConfig>,
        filters: Arc<Filters>,
        schema: Arc<RwLock<MySqlSchema>>,
        conn: C,
        source: SourceInfo,
        sink: mpsc::Sender<ChangeEvent>,
        cancel: CancellationToken,
        metrics: Arc<SnapshotMetrics>,
    ) -> Self {
        Self {
            config,
            filters,
            schema,
            conn,
            source,
            sink,
            cancel,
            metrics,
        }
    }

    /// Run the snapshot to completion. Returns the [`SourceInfo`] the
    /// streaming subsystem starts from; the transaction, lock, and
    /// session state are released on every exit path.
    pub(crate) async fn execute(mut self) -> Result<SourceInfo> {
        let started = Instant::now();
        let ts_ms = chrono::Utc::now().timestamp_millis();
        info!(
            "starting snapshot of {}:{} with user '{}'",
            self.config.hostname, self.config.port, self.config.user
        );
        probe::log_user_grants(&mut self.conn, &self.config.user).await;
        probe::log_server_variables(&mut self.conn).await;
        self.metrics.snapshot_started();

        let mut state = ProtocolState {
            locked: false,
            txn_open: false,
            lock_acquired_at: None,
        };
        let outcome = self.run_protocol(&mut state, ts_ms).await;
        let cleanup = self.cleanup(&mut state, outcome.is_ok()).await;

        match outcome.and(cleanup) {
            Ok(()) => {
                self.source.complete_snapshot();
                self.metrics.snapshot_completed();
                info!("completed snapshot in {:?}", started.elapsed());
                Ok(self.source)
            }
            Err(e) => {
                self.metrics.snapshot_aborted();
                if e.is_cancellation() {
                    info!(
                        "stopped snapshot after {:?} before completing",
                        started.elapsed()
                    );
                }
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(CdcError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn run_protocol(&mut self, state: &mut ProtocolState, ts_ms: i64) -> Result<()> {
        // Step 0: every SELECT in the transaction must read from one MVCC
        // snapshot, which REPEATABLE READ guarantees.
        self.check_cancelled()?;
        info!("step 0: disabling autocommit and enabling repeatable read transactions");
        self.conn
            .execute("SET autocommit=0")
            .await
            .map_err(CdcError::into_fatal)?;
        self.conn
            .execute("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(CdcError::into_fatal)?;

        let charset_vars = probe::read_charset_system_variables(&mut self.conn)
            .await
            .map_err(CdcError::into_fatal)?;
        let set_statement = probe::set_statement_for(&charset_vars);

        // Step 1: pin the transaction's view immediately.
        self.check_cancelled()?;
        info!("step 1: start transaction with consistent snapshot");
        self.conn
            .execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
            .await
            .map_err(CdcError::into_fatal)?;
        state.txn_open = true;

        // Step 2: block all writes until the coordinate and schemas are
        // captured. Minimize the time this is held.
        self.check_cancelled()?;
        info!("step 2: flush and obtain global read lock (preventing writes to database)");
        self.conn
            .execute("FLUSH TABLES WITH READ LOCK")
            .await
            .map_err(CdcError::into_fatal)?;
        state.locked = true;
        state.lock_acquired_at = Some(Instant::now());
        self.metrics.global_lock_acquired();

        // Step 3: the coordinate every snapshot record carries.
        self.check_cancelled()?;
        info!("step 3: read binlog position of MySQL master");
        let coordinate = probe::read_binlog_coordinate(&mut self.conn)
            .await
            .map_err(CdcError::into_fatal)?;
        match &coordinate.gtid_set {
            Some(gtids) => info!(
                "\t using binlog '{}' at position {} and gtid '{}'",
                coordinate.file, coordinate.position, gtids
            ),
            None => info!(
                "\t using binlog '{}' at position {}",
                coordinate.file, coordinate.position
            ),
        }
        self.source
            .set_binlog_start_point(coordinate.file, coordinate.position);
        self.source.set_completed_gtid_set(coordinate.gtid_set);
        self.source.start_snapshot();

        // Step 4
        self.check_cancelled()?;
        info!("step 4: read list of available databases");
        let databases: Vec<String> = probe::read_catalog_names(&mut self.conn)
            .await
            .map_err(CdcError::into_fatal)?
            .into_iter()
            .filter(|db| self.filters.database_filter(db))
            .collect();
        info!("\t list of available databases is: {databases:?}");

        // Step 5: the server occasionally surfaces stray local files as
        // databases; those fail to list and are skipped with a warning.
        self.check_cancelled()?;
        info!("step 5: read list of available tables in each database");
        let mut table_ids: Vec<TableId> = Vec::new();
        let mut tables_by_db: BTreeMap<String, Vec<TableId>> = BTreeMap::new();
        let mut readable: BTreeSet<String> = BTreeSet::new();
        for db in &databases {
            self.check_cancelled()?;
            match probe::read_table_names_in(&mut self.conn, db).await {
                Ok(ids) => {
                    readable.insert(db.clone());
                    for id in ids {
                        if self.filters.table_filter(id.catalog(), id.table()) {
                            info!("\t including '{id}'");
                            tables_by_db.entry(db.clone()).or_default().push(id.clone());
                            table_ids.push(id);
                        } else {
                            info!("\t '{id}' is filtered out, discarding");
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("\t skipping database '{db}' due to error reading tables: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        info!("\t snapshot continuing with databases: {readable:?}");

        // Step 6
        self.rebuild_schema(&set_statement, &table_ids, &tables_by_db, &readable, ts_ms)
            .await?;

        // Step 7: with minimal locking the REPEATABLE READ view carries
        // the rest of the scan, so writes can resume now.
        if self.config.snapshot_minimal_locks && state.locked {
            info!("step 7: releasing global read lock to enable MySQL writes");
            self.conn
                .execute("UNLOCK TABLES")
                .await
                .map_err(CdcError::into_fatal)?;
            state.locked = false;
            if let Some(at) = state.lock_acquired_at {
                let held = at.elapsed();
                self.metrics.global_lock_released(held);
                info!("step 7: blocked writes to MySQL for a total of {held:?}");
            }
        }

        // Step 8
        self.check_cancelled()?;
        if self.config.snapshot_mode.includes_data() {
            let mut queue = BufferedLastRecordQueue::new(self.sink.clone());
            self.scan_tables(&table_ids, ts_ms, &mut queue).await?;

            // All tables are copied but the buffer still holds the very
            // last record. Rewrite its offset to the position streaming
            // resumes from.
            self.source.mark_last_snapshot();
            let final_offset = self.source.offset();
            queue
                .flush(
                    move |mut event| {
                        event.offset = final_offset;
                        event
                    },
                    &self.cancel,
                )
                .await?;
        } else {
            info!("step 8: schema-only snapshot, skipping contents of all tables");
        }

        Ok(())
    }

    /// Step 6: replay synthetic DDL so the schema model (and through it
    /// the downstream registry) converges on the exact current state,
    /// regardless of what it held before.
    async fn rebuild_schema(
        &mut self,
        set_statement: &str,
        discovered: &[TableId],
        tables_by_db: &BTreeMap<String, Vec<TableId>>,
        readable: &BTreeSet<String>,
        ts_ms: i64,
    ) -> Result<()> {
        info!("step 6: generating DROP and CREATE statements to reflect current database schemas");
        let mut emitted: Vec<(Option<String>, String)> = Vec::new();
        let mut record =
            |db: Option<&str>, ddl: &str| emitted.push((db.map(str::to_string), ddl.to_string()));

        {
            let mut schema = self.schema.write().unwrap();

            // The charset variables first; they are database-agnostic.
            schema.apply_ddl(&self.source, None, set_statement, &mut record)?;

            // Drop every table previously known or just discovered.
            let mut all_ids: BTreeSet<TableId> = schema.table_ids().into_iter().collect();
            all_ids.extend(discovered.iter().cloned());
            for id in &all_ids {
                if self.cancel.is_cancelled() {
                    return Err(CdcError::Cancelled);
                }
                schema.apply_ddl(
                    &self.source,
                    Some(id.catalog()),
                    &format!("DROP TABLE IF EXISTS {}", quote_table(id)),
                    &mut record,
                )?;
            }

            // Drop databases the model knows but the server no longer
            // offers for reading.
            let known = schema.catalog_names();
            for db in known.iter().filter(|db| !readable.contains(*db)) {
                if self.cancel.is_cancelled() {
                    return Err(CdcError::Cancelled);
                }
                schema.apply_ddl(
                    &self.source,
                    Some(db.as_str()),
                    &format!("DROP DATABASE IF EXISTS {}", quote_ident(db)),
                    &mut record,
                )?;
            }
        }

        // Recreate each discovered database and replay the server's own
        // CREATE TABLE statements.
        for (db, ids) in tables_by_db {
            self.check_cancelled()?;
            {
                let mut schema = self.schema.write().unwrap();
                schema.apply_ddl(
                    &self.source,
                    Some(db.as_str()),
                    &format!("DROP DATABASE IF EXISTS {}", quote_ident(db)),
                    &mut record,
                )?;
                schema.apply_ddl(
                    &self.source,
                    Some(db.as_str()),
                    &format!("CREATE DATABASE {}", quote_ident(db)),
                    &mut record,
                )?;
                schema.apply_ddl(
                    &self.source,
                    Some(db.as_str()),
                    &format!("USE {}", quote_ident(db)),
                    &mut record,
                )?;
            }
            for id in ids {
                self.check_cancelled()?;
                let rows = self
                    .conn
                    .query(&format!("SHOW CREATE TABLE {}", quote_table(id)))
                    .await
                    .map_err(CdcError::into_fatal)?;
                let Some(ddl) = rows
                    .first()
                    .and_then(|r| r.get(1))
                    .and_then(SqlValue::as_text)
                    .map(str::to_string)
                else {
                    warn!("\t no CREATE TABLE statement returned for '{id}'");
                    continue;
                };
                let mut schema = self.schema.write().unwrap();
                if let Err(e) = schema.apply_ddl(&self.source, Some(db.as_str()), &ddl, &mut record) {
                    warn!("\t could not apply DDL for '{id}': {e}");
                }
            }
        }

        if self.config.include_schema_changes {
            for (db, ddl) in &emitted {
                info!("\t{ddl}");
                let event = ChangeEvent::schema_change(
                    self.config.server_name.clone(),
                    db.as_deref(),
                    ddl,
                    self.source.partition(),
                    self.source.offset(),
                    ts_ms,
                );
                self.send_event(event).await?;
                self.metrics.record_ddl();
            }
        }
        Ok(())
    }

    /// Step 8: dump each selected table under the pinned MVCC view.
    async fn scan_tables(
        &mut self,
        table_ids: &[TableId],
        ts_ms: i64,
        queue: &mut BufferedLastRecordQueue,
    ) -> Result<()> {
        info!("step 8: scanning contents of {} tables", table_ids.len());
        self.metrics.set_table_count(table_ids.len() as u64);
        let makers = RecordMakers::new(self.config.server_name.clone(), self.filters.clone());
        let scan_started = Instant::now();
        let mut total_rows = 0u64;

        for (table_no, id) in table_ids.iter().enumerate() {
            self.check_cancelled()?;

            let table = {
                let schema = self.schema.read().unwrap();
                schema.table_for(id).cloned()
            };
            let Some(table) = table else {
                warn!("\t no schema captured for '{id}', skipping its contents");
                continue;
            };

            self.conn
                .execute(&format!("USE {}", quote_ident(id.catalog())))
                .await
                .map_err(CdcError::into_fatal)?;

            // Pick the cursor per table: a buffered result set is fine
            // for small tables, large ones go through a forward-only
            // streaming cursor so memory stays bounded. The estimate
            // from SHOW TABLE STATUS is approximate but far cheaper
            // than COUNT(*) on InnoDB.
            let threshold = self.config.min_row_count_to_stream_results;
            let mut buffered = false;
            let mut row_count_hint = String::from("<unknown>");
            if threshold > 0 {
                match self
                    .conn
                    .query(&format!("SHOW TABLE STATUS LIKE '{}'", id.table()))
                    .await
                {
                    Ok(rows) => {
                        if let Some(estimate) =
                            rows.first().and_then(|r| r.get(4)).and_then(SqlValue::as_u64)
                        {
                            buffered = estimate <= threshold;
                            row_count_hint = estimate.to_string();
                        }
                    }
                    Err(e) => {
                        debug!("error while getting number of rows in table '{id}': {e}");
                    }
                }
            }

            info!(
                "step 8: - scanning table '{}' ({} of {} tables, ~{} rows)",
                id,
                table_no + 1,
                table_ids.len(),
                row_count_hint
            );
            let select = format!("SELECT * FROM {}", quote_table(id));
            let table_started = Instant::now();
            let kind = self.config.snapshot_record_kind;
            let mut recorder = makers.for_table(&table, &self.source, queue, self.cancel.clone());
            let mut rows_scanned = 0u64;
            let mut cancelled = false;

            if buffered {
                let rows = self.conn.query(&select).await.map_err(CdcError::into_fatal)?;
                for row in &rows {
                    record_row(&mut recorder, kind, row, ts_ms).await?;
                    rows_scanned += 1;
                    if rows_scanned % CANCEL_CHECK_ROWS == 0 && self.cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    if rows_scanned % PROGRESS_ROWS == 0 {
                        self.metrics.record_rows(PROGRESS_ROWS);
                        info!(
                            "step 8: - {} of ~{} rows scanned from table '{}' after {:?}",
                            rows_scanned,
                            row_count_hint,
                            id,
                            table_started.elapsed()
                        );
                    }
                }
            } else {
                let mut stream = self
                    .conn
                    .query_stream(&select)
                    .await
                    .map_err(CdcError::into_fatal)?;
                while let Some(item) = stream.next().await {
                    let row = item.map_err(CdcError::into_fatal)?;
                    record_row(&mut recorder, kind, &row, ts_ms).await?;
                    rows_scanned += 1;
                    if rows_scanned % CANCEL_CHECK_ROWS == 0 && self.cancel.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    if rows_scanned % PROGRESS_ROWS == 0 {
                        self.metrics.record_rows(PROGRESS_ROWS);
                        info!(
                            "step 8: - {} of ~{} rows scanned from table '{}' after {:?}",
                            rows_scanned,
                            row_count_hint,
                            id,
                            table_started.elapsed()
                        );
                    }
                }
            }

            self.metrics.record_rows(rows_scanned % PROGRESS_ROWS);
            self.metrics.table_completed();
            total_rows += rows_scanned;
            if cancelled {
                info!("step 8: stopping the snapshot due to cancellation");
                return Err(CdcError::Cancelled);
            }
            info!(
                "step 8: - completed scanning a total of {} rows from table '{}' after {:?}",
                rows_scanned,
                id,
                table_started.elapsed()
            );
        }

        info!(
            "step 8: scanned {} rows in {} tables in {:?}",
            total_rows,
            table_ids.len(),
            scan_started.elapsed()
        );
        Ok(())
    }

    /// Steps 9 and 10: always executed, idempotent, safe to run after a
    /// failure at any earlier point.
    async fn cleanup(&mut self, state: &mut ProtocolState, success: bool) -> Result<()> {
        if state.locked {
            info!("step 9: releasing global read lock to enable MySQL writes");
            match self.conn.execute("UNLOCK TABLES").await {
                Ok(()) => {
                    state.locked = false;
                    if let Some(at) = state.lock_acquired_at {
                        let held = at.elapsed();
                        self.metrics.global_lock_released(held);
                        info!("writes to MySQL prevented for a total of {held:?}");
                    }
                }
                Err(e) => warn!("failed to release global read lock: {e}"),
            }
        }

        if state.txn_open {
            state.txn_open = false;
            if success {
                info!("step 10: committing transaction");
                self.conn
                    .execute("COMMIT")
                    .await
                    .map_err(CdcError::into_fatal)?;
            } else {
                info!("step 10: rolling back transaction after abort");
                if let Err(e) = self.conn.execute("ROLLBACK").await {
                    warn!("failed to roll back transaction: {e}");
                }
            }
        }
        Ok(())
    }

    async fn send_event(&self, event: ChangeEvent) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CdcError::Cancelled),
            sent = self.sink.send(event) => sent.map_err(|_| CdcError::Cancelled),
        }
    }
}

/// Dispatch on the configured event kind. A tagged variant is all the
/// polymorphism the recorder needs.
async fn record_row(
    recorder: &mut crate::mysql::records::RecordsForTable<'_>,
    kind: SnapshotRecordKind,
    row: &crate::mysql::connection::SqlRow,
    ts_ms: i64,
) -> Result<()> {
    match kind {
        SnapshotRecordKind::Read => recorder.read(row, ts_ms).await,
        SnapshotRecordKind::Create => recorder.create(row, ts_ms).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SnapshotMode;
    use crate::mysql::connection::MemoryConnection;

    fn orchestrator(
        config: CdcConfig,
        conn: MemoryConnection,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> SnapshotOrchestrator<MemoryConnection> {
        let config = Arc::new(config);
        let filters = Arc::new(Filters::new(&config).unwrap());
        let source = SourceInfo::new(config.server_name.clone());
        let metrics = Arc::new(SnapshotMetrics::new(config.server_name.clone()));
        SnapshotOrchestrator::new(
            config,
            filters,
            Arc::new(RwLock::new(MySqlSchema::new())),
            conn,
            source,
            sink,
            CancellationToken::new(),
            metrics,
        )
    }

    fn scripted_connection() -> MemoryConnection {
        let mut conn = MemoryConnection::new();
        conn.set_master_status("binlog.000003", 154, None);
        conn.add_table(
            "shop",
            "orders",
            "CREATE TABLE `orders` (`id` int NOT NULL, `name` varchar(32), PRIMARY KEY (`id`))",
            vec![
                vec![1i64.into(), "a".into()],
                vec![2i64.into(), "b".into()],
            ],
        );
        conn
    }

    #[tokio::test]
    async fn test_non_minimal_locking_unlocks_after_scan() {
        let conn = scripted_connection();
        let log = conn.statement_log();
        let (tx, mut rx) = mpsc::channel(64);
        let config = CdcConfig::new("localhost", "repl", "inventory").with_minimal_locks(false);

        let source = orchestrator(config, conn, tx).execute().await.unwrap();
        assert!(source.binlog_coordinate().is_some());
        drop(rx.try_recv());

        let log = log.lock().unwrap();
        let unlock = log.iter().position(|s| s == "UNLOCK TABLES").unwrap();
        let select = log
            .iter()
            .position(|s| s.starts_with("SELECT * FROM"))
            .unwrap();
        let commit = log.iter().position(|s| s == "COMMIT").unwrap();
        // Without minimal locking the lock outlives the whole scan.
        assert!(select < unlock);
        assert!(unlock < commit);
        assert_eq!(log.iter().filter(|s| *s == "UNLOCK TABLES").count(), 1);
    }

    #[tokio::test]
    async fn test_schema_only_mode_skips_selects() {
        let conn = scripted_connection();
        let log = conn.statement_log();
        let (tx, mut rx) = mpsc::channel(64);
        let config = CdcConfig::new("localhost", "repl", "inventory")
            .with_snapshot_mode(SnapshotMode::SchemaOnly);

        orchestrator(config, conn, tx).execute().await.unwrap();

        let mut data_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.topic != "inventory" {
                data_events += 1;
            }
        }
        assert_eq!(data_events, 0);

        let log = log.lock().unwrap();
        assert!(!log.iter().any(|s| s.starts_with("SELECT * FROM")));
        assert!(log.iter().any(|s| s == "COMMIT"));
    }

    #[tokio::test]
    async fn test_fatal_lock_failure_rolls_back() {
        let mut conn = scripted_connection();
        conn.fail_on("FLUSH TABLES");
        let log = conn.statement_log();
        let (tx, _rx) = mpsc::channel(64);
        let config = CdcConfig::new("localhost", "repl", "inventory");

        let err = orchestrator(config, conn, tx).execute().await.unwrap_err();
        assert!(matches!(err, CdcError::Fatal(_)));

        let log = log.lock().unwrap();
        // Transaction was open, so it is rolled back; the lock was never
        // acquired, so no UNLOCK is issued.
        assert!(log.iter().any(|s| s == "ROLLBACK"));
        assert!(!log.iter().any(|s| s == "UNLOCK TABLES"));
        assert!(!log.iter().any(|s| s == "COMMIT"));
    }
}
