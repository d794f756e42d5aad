//! Connection seam for the snapshot engine
//!
//! The orchestrator drives a MySQL session through plain SQL text, so the
//! seam is narrow: execute a statement, run a query into a buffered
//! result, or run a query through a forward-only streaming cursor. The
//! production implementation wraps a `mysql_async` connection; the
//! [`MemoryConnection`] fake interprets the same statements against
//! in-memory tables and records everything it was asked to do, which is
//! what the protocol tests assert against.

use crate::common::{CdcError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// One column value as read from the server.
///
/// `Null` is distinct from empty text or empty bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// Borrow as text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Read as an unsigned integer, if numeric and in range.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(n) => Some(*n),
            Self::Int(n) if *n >= 0 => Some(*n as u64),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// True for SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Convert to a JSON value for event payloads. Binary data that is
    /// not valid UTF-8 is rendered as hex.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Int(n) => serde_json::Value::Number((*n).into()),
            Self::UInt(n) => serde_json::Value::Number((*n).into()),
            Self::Float(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Bytes(bytes) => serde_json::Value::String(hex::encode(bytes)),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for SqlValue {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(n: u64) -> Self {
        Self::UInt(n)
    }
}

impl From<f64> for SqlValue {
    fn from(n: f64) -> Self {
        Self::Float(n)
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// One row: ordered column values.
pub type SqlRow = Vec<SqlValue>;

/// A stream of rows from a forward-only cursor.
pub type RowStream<'a> = BoxStream<'a, Result<SqlRow>>;

/// The session the snapshot orchestrator owns exclusively.
#[async_trait]
pub trait SnapshotConnection: Send {
    /// Execute a statement, discarding any result.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a query and buffer the full result set.
    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>>;

    /// Run a query through a streaming, forward-only cursor. Used for
    /// tables too large to buffer.
    async fn query_stream<'a>(&'a mut self, sql: &str) -> Result<RowStream<'a>>;
}

// ============================================================================
// mysql_async implementation
// ============================================================================

/// Production connection over `mysql_async`.
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    /// Open a connection to the configured server.
    pub async fn connect(config: &crate::common::CdcConfig) -> Result<Self> {
        // URL-encode credentials so special characters survive.
        let user: String =
            url::form_urlencoded::byte_serialize(config.user.as_bytes()).collect();
        let password: String = url::form_urlencoded::byte_serialize(
            config.password.as_deref().unwrap_or("").as_bytes(),
        )
        .collect();
        let url = format!(
            "mysql://{}:{}@{}:{}/",
            user, password, config.hostname, config.port
        );
        let opts = Opts::from_url(&url)
            .map_err(|e| CdcError::config(format!("invalid connection parameters: {e}")))?;

        let conn = tokio::time::timeout(config.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                CdcError::connection(format!(
                    "timed out connecting to {}:{}",
                    config.hostname, config.port
                ))
            })?
            .map_err(|e| CdcError::connection(format!("MySQL connection failed: {e}")))?;

        Ok(Self { conn })
    }

    /// Wrap an already-established connection.
    pub fn from_conn(conn: Conn) -> Self {
        Self { conn }
    }
}

fn sql_error(e: mysql_async::Error) -> CdcError {
    CdcError::transient(format!("MySQL error: {e}"))
}

fn convert_value(value: Value) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Int(n) => SqlValue::Int(n),
        Value::UInt(n) => SqlValue::UInt(n),
        Value::Float(n) => SqlValue::Float(n as f64),
        Value::Double(n) => SqlValue::Float(n),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => SqlValue::Text(s),
            Err(e) => SqlValue::Bytes(e.into_bytes()),
        },
        Value::Date(year, month, day, hour, min, sec, micro) => SqlValue::Text(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, min, sec, micro
        )),
        Value::Time(neg, days, hours, mins, secs, micro) => {
            let sign = if neg { "-" } else { "" };
            let total_hours = days * 24 + hours as u32;
            SqlValue::Text(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, total_hours, mins, secs, micro
            ))
        }
    }
}

fn convert_row(row: mysql_async::Row) -> SqlRow {
    (0..row.len())
        .map(|i| match row.get_opt::<Value, _>(i) {
            Some(Ok(value)) => convert_value(value),
            _ => SqlValue::Null,
        })
        .collect()
}

#[async_trait]
impl SnapshotConnection for MySqlConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn.query_drop(sql).await.map_err(sql_error)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>> {
        let rows: Vec<mysql_async::Row> = self.conn.query(sql).await.map_err(sql_error)?;
        Ok(rows.into_iter().map(convert_row).collect())
    }

    async fn query_stream<'a>(&'a mut self, sql: &str) -> Result<RowStream<'a>> {
        let stream = self
            .conn
            .query_stream::<mysql_async::Row, _>(sql.to_string())
            .await
            .map_err(sql_error)?;
        Ok(Box::pin(stream.map(|item| {
            item.map(convert_row).map_err(sql_error)
        })))
    }
}

// ============================================================================
// In-memory fake for tests
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryTable {
    ddl: String,
    rows: Vec<SqlRow>,
    reported_row_count: Option<u64>,
}

/// In-memory stand-in for a MySQL server.
///
/// Interprets the statement dialect the snapshot engine issues (`SHOW
/// DATABASES`, `SHOW TABLES IN`, `SHOW CREATE TABLE`, `SELECT * FROM`,
/// ...) against scripted tables, and records every statement it was
/// handed. Protocol tests assert on the statement log the way the real
/// server would experience the session.
pub struct MemoryConnection {
    databases: BTreeMap<String, BTreeMap<String, MemoryTable>>,
    master_status: Option<(String, u64, Option<String>)>,
    charset_variables: Vec<(String, String)>,
    grants: Vec<String>,
    unreadable_databases: HashSet<String>,
    fail_statements: Vec<String>,
    current_database: Option<String>,
    log: Arc<Mutex<Vec<String>>>,
    streamed: Arc<Mutex<Vec<String>>>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            databases: BTreeMap::new(),
            master_status: None,
            charset_variables: vec![
                ("character_set_server".to_string(), "utf8mb4".to_string()),
                ("collation_server".to_string(), "utf8mb4_0900_ai_ci".to_string()),
            ],
            grants: vec![
                "GRANT SELECT, RELOAD, REPLICATION SLAVE, REPLICATION CLIENT ON *.* TO 'repl'"
                    .to_string(),
            ],
            unreadable_databases: HashSet::new(),
            fail_statements: Vec::new(),
            current_database: None,
            log: Arc::new(Mutex::new(Vec::new())),
            streamed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the `SHOW MASTER STATUS` answer. Leaving it unset simulates a
    /// server with the binlog disabled.
    pub fn set_master_status(
        &mut self,
        file: impl Into<String>,
        position: u64,
        gtid_set: Option<&str>,
    ) {
        self.master_status = Some((file.into(), position, gtid_set.map(str::to_string)));
    }

    /// Register a table with its `SHOW CREATE TABLE` DDL and contents.
    pub fn add_table(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        ddl: impl Into<String>,
        rows: Vec<SqlRow>,
    ) {
        self.databases.entry(database.into()).or_default().insert(
            table.into(),
            MemoryTable {
                ddl: ddl.into(),
                rows,
                reported_row_count: None,
            },
        );
    }

    /// Register an empty database.
    pub fn add_database(&mut self, database: impl Into<String>) {
        self.databases.entry(database.into()).or_default();
    }

    /// Override the row count `SHOW TABLE STATUS` reports for a table.
    pub fn set_reported_row_count(&mut self, database: &str, table: &str, rows: u64) {
        if let Some(t) = self
            .databases
            .get_mut(database)
            .and_then(|d| d.get_mut(table))
        {
            t.reported_row_count = Some(rows);
        }
    }

    /// Make `SHOW TABLES IN` fail for a database, the way the server
    /// occasionally surfaces stray local files as databases.
    pub fn mark_database_unreadable(&mut self, database: impl Into<String>) {
        let database = database.into();
        self.databases.entry(database.clone()).or_default();
        self.unreadable_databases.insert(database);
    }

    /// Fail any statement containing `fragment`.
    pub fn fail_on(&mut self, fragment: impl Into<String>) {
        self.fail_statements.push(fragment.into());
    }

    /// Replace the reported user grants.
    pub fn set_grants(&mut self, grants: Vec<String>) {
        self.grants = grants;
    }

    /// Shared handle on the statement log.
    pub fn statement_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    /// Shared handle on the log of statements run through a streaming
    /// cursor.
    pub fn streamed_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.streamed)
    }

    fn record(&self, sql: &str) -> Result<()> {
        self.log.lock().unwrap().push(sql.to_string());
        for fragment in &self.fail_statements {
            if sql.contains(fragment.as_str()) {
                return Err(CdcError::transient(format!(
                    "injected failure for statement: {sql}"
                )));
            }
        }
        Ok(())
    }

    fn table(&self, database: &str, table: &str) -> Result<&MemoryTable> {
        self.databases
            .get(database)
            .and_then(|d| d.get(table))
            .ok_or_else(|| CdcError::transient(format!("unknown table {database}.{table}")))
    }

    fn dispatch(&mut self, sql: &str) -> Result<Vec<SqlRow>> {
        let sql = sql.trim().trim_end_matches(';').trim();

        if sql == "SHOW MASTER STATUS" {
            return Ok(match &self.master_status {
                Some((file, pos, gtid)) => {
                    let mut row: SqlRow = vec![
                        SqlValue::Text(file.clone()),
                        SqlValue::UInt(*pos),
                        SqlValue::Text(String::new()),
                        SqlValue::Text(String::new()),
                    ];
                    if let Some(gtid) = gtid {
                        row.push(SqlValue::Text(gtid.clone()));
                    }
                    vec![row]
                }
                None => vec![],
            });
        }

        if sql == "SHOW DATABASES" {
            return Ok(self
                .databases
                .keys()
                .map(|db| vec![SqlValue::Text(db.clone())])
                .collect());
        }

        if let Some(rest) = sql.strip_prefix("SHOW TABLES IN ") {
            let db = unquote(rest);
            if self.unreadable_databases.contains(&db) {
                return Err(CdcError::transient(format!(
                    "can't read dir of './{db}/'"
                )));
            }
            let tables = self
                .databases
                .get(&db)
                .ok_or_else(|| CdcError::transient(format!("unknown database {db}")))?;
            return Ok(tables
                .keys()
                .map(|t| vec![SqlValue::Text(t.clone())])
                .collect());
        }

        if let Some(rest) = sql.strip_prefix("SHOW CREATE TABLE ") {
            let (db, table) = unquote_qualified(rest, self.current_database.as_deref())?;
            let t = self.table(&db, &table)?;
            return Ok(vec![vec![
                SqlValue::Text(table.clone()),
                SqlValue::Text(t.ddl.clone()),
            ]]);
        }

        if let Some(rest) = sql.strip_prefix("SHOW TABLE STATUS LIKE ") {
            let table = rest.trim_matches('\'').to_string();
            let db = self
                .current_database
                .clone()
                .ok_or_else(|| CdcError::transient("no database selected"))?;
            let t = self.table(&db, &table)?;
            let rows = t.reported_row_count.unwrap_or(t.rows.len() as u64);
            return Ok(vec![vec![
                SqlValue::Text(table),
                SqlValue::Text("InnoDB".to_string()),
                SqlValue::UInt(10),
                SqlValue::Text("Dynamic".to_string()),
                SqlValue::UInt(rows),
            ]]);
        }

        if sql.starts_with("SHOW VARIABLES") {
            return Ok(self
                .charset_variables
                .iter()
                .map(|(name, value)| {
                    vec![SqlValue::Text(name.clone()), SqlValue::Text(value.clone())]
                })
                .collect());
        }

        if sql == "SHOW GRANTS FOR CURRENT_USER" {
            return Ok(self
                .grants
                .iter()
                .map(|g| vec![SqlValue::Text(g.clone())])
                .collect());
        }

        if let Some(rest) = sql.strip_prefix("SELECT * FROM ") {
            let (db, table) = unquote_qualified(rest, self.current_database.as_deref())?;
            return Ok(self.table(&db, &table)?.rows.clone());
        }

        Err(CdcError::transient(format!("unsupported query: {sql}")))
    }
}

/// Strip backticks from one identifier.
fn unquote(ident: &str) -> String {
    ident.trim().trim_matches('`').to_string()
}

/// Split an optionally `db`.`table`-qualified reference.
fn unquote_qualified(reference: &str, default_db: Option<&str>) -> Result<(String, String)> {
    let reference = reference.trim().trim_end_matches(';');
    match reference.split_once("`.`") {
        Some((db, table)) => Ok((unquote(db), unquote(table))),
        None => {
            let table = unquote(reference);
            let db = default_db
                .ok_or_else(|| CdcError::transient(format!("no database for table {table}")))?;
            Ok((db.to_string(), table))
        }
    }
}

#[async_trait]
impl SnapshotConnection for MemoryConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.record(sql)?;
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if let Some(rest) = trimmed.strip_prefix("USE ") {
            self.current_database = Some(unquote(rest));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<SqlRow>> {
        self.record(sql)?;
        self.dispatch(sql)
    }

    async fn query_stream<'a>(&'a mut self, sql: &str) -> Result<RowStream<'a>> {
        self.record(sql)?;
        self.streamed.lock().unwrap().push(sql.to_string());
        let rows = self.dispatch(sql)?;
        Ok(Box::pin(futures::stream::iter(rows.into_iter().map(Ok))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_orders() -> MemoryConnection {
        let mut conn = MemoryConnection::new();
        conn.set_master_status("binlog.000003", 154, None);
        conn.add_table(
            "shop",
            "orders",
            "CREATE TABLE `orders` (`id` int NOT NULL, PRIMARY KEY (`id`))",
            vec![vec![1i64.into()], vec![2i64.into()]],
        );
        conn
    }

    #[tokio::test]
    async fn test_show_databases_and_tables() {
        let mut conn = conn_with_orders();
        let dbs = conn.query("SHOW DATABASES").await.unwrap();
        assert_eq!(dbs, vec![vec![SqlValue::Text("shop".into())]]);

        let tables = conn.query("SHOW TABLES IN `shop`").await.unwrap();
        assert_eq!(tables[0][0].as_text(), Some("orders"));
    }

    #[tokio::test]
    async fn test_master_status_empty_when_unset() {
        let mut conn = MemoryConnection::new();
        let rows = conn.query("SHOW MASTER STATUS").await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_select_requires_known_table() {
        let mut conn = conn_with_orders();
        let rows = conn.query("SELECT * FROM `shop`.`orders`").await.unwrap();
        assert_eq!(rows.len(), 2);

        let err = conn.query("SELECT * FROM `shop`.`missing`").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_use_sets_default_database() {
        let mut conn = conn_with_orders();
        conn.execute("USE `shop`").await.unwrap();
        let rows = conn
            .query("SHOW TABLE STATUS LIKE 'orders'")
            .await
            .unwrap();
        assert_eq!(rows[0][4].as_u64(), Some(2));
    }

    #[tokio::test]
    async fn test_unreadable_database_errors() {
        let mut conn = conn_with_orders();
        conn.mark_database_unreadable("lost+found");
        let err = conn.query("SHOW TABLES IN `lost+found`").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_statement_and_stream_logs() {
        let mut conn = conn_with_orders();
        let log = conn.statement_log();
        let streamed = conn.streamed_log();

        conn.execute("FLUSH TABLES WITH READ LOCK").await.unwrap();
        let mut stream = conn.query_stream("SELECT * FROM `shop`.`orders`").await.unwrap();
        let mut count = 0;
        while let Some(row) = stream.next().await {
            row.unwrap();
            count += 1;
        }
        drop(stream);

        assert_eq!(count, 2);
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(streamed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fail_on_injection() {
        let mut conn = conn_with_orders();
        conn.fail_on("FLUSH TABLES");
        let err = conn.execute("FLUSH TABLES WITH READ LOCK").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_sql_value_json() {
        assert_eq!(SqlValue::Null.to_json(), serde_json::Value::Null);
        assert_eq!(SqlValue::Int(-7).to_json(), serde_json::json!(-7));
        assert_eq!(SqlValue::Text("a".into()).to_json(), serde_json::json!("a"));
        assert_eq!(
            SqlValue::Bytes(vec![0xde, 0xad]).to_json(),
            serde_json::json!("dead")
        );
    }

    #[test]
    fn test_sql_value_null_distinct_from_empty() {
        assert!(SqlValue::Null.is_null());
        assert!(!SqlValue::Text(String::new()).is_null());
        assert_ne!(SqlValue::Null, SqlValue::Text(String::new()));
    }
}
