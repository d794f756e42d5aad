//! Server probe
//!
//! Read-only queries against the session: catalog and table listings,
//! charset system variables, the binlog coordinate, and user grants.
//! Every operation surfaces SQL failures as [`CdcError::Transient`]; the
//! orchestrator decides which of those abort the snapshot.

use crate::common::{CdcError, Result};
use crate::mysql::connection::{SnapshotConnection, SqlValue};
use crate::mysql::schema::{quote_ident, TableId};
use crate::mysql::source_info::BinlogCoordinate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

/// List the databases visible to the session.
pub async fn read_catalog_names<C: SnapshotConnection>(conn: &mut C) -> Result<BTreeSet<String>> {
    let rows = conn.query("SHOW DATABASES").await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_text))
        .map(str::to_string)
        .collect())
}

/// List the tables of one database.
pub async fn read_table_names_in<C: SnapshotConnection>(
    conn: &mut C,
    database: &str,
) -> Result<Vec<TableId>> {
    let rows = conn
        .query(&format!("SHOW TABLES IN {}", quote_ident(database)))
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_text))
        .map(|table| TableId::new(database, table))
        .collect())
}

/// List every table in every visible database. Unlike the orchestrator's
/// enumeration this propagates the first failure; use it when a partial
/// answer is not acceptable.
pub async fn read_all_table_names<C: SnapshotConnection>(conn: &mut C) -> Result<Vec<TableId>> {
    let mut tables = Vec::new();
    for database in read_catalog_names(conn).await? {
        tables.extend(read_table_names_in(conn, &database).await?);
    }
    Ok(tables)
}

/// Read the charset-related system variables that the synthetic `SET`
/// statement reproduces for the schema registry.
pub async fn read_charset_system_variables<C: SnapshotConnection>(
    conn: &mut C,
) -> Result<BTreeMap<String, String>> {
    let rows = conn
        .query("SHOW VARIABLES WHERE Variable_name IN ('character_set_server', 'collation_server')")
        .await?;
    Ok(rows
        .iter()
        .filter_map(|row| {
            let name = row.first().and_then(SqlValue::as_text)?;
            let value = row.get(1).and_then(SqlValue::as_text)?;
            Some((name.to_string(), value.to_string()))
        })
        .collect())
}

/// Render system variables as the `SET` statement replayed into the
/// schema model.
pub fn set_statement_for(variables: &BTreeMap<String, String>) -> String {
    if variables.is_empty() {
        return String::new();
    }
    let assignments: Vec<String> = variables
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    format!("SET {}", assignments.join(", "))
}

/// Read the current binlog coordinate via `SHOW MASTER STATUS`.
///
/// Fails with [`CdcError::Precondition`] when the server returns no row,
/// which means the binlog is disabled and a snapshot could never hand
/// off to streaming.
pub async fn read_binlog_coordinate<C: SnapshotConnection>(
    conn: &mut C,
) -> Result<BinlogCoordinate> {
    let rows = conn.query("SHOW MASTER STATUS").await?;
    let row = rows.first().ok_or_else(|| {
        CdcError::precondition(
            "cannot read the binlog filename and position via 'SHOW MASTER STATUS'; \
             make sure the server is configured with binary logging enabled",
        )
    })?;

    let file = row
        .first()
        .and_then(SqlValue::as_text)
        .ok_or_else(|| CdcError::precondition("SHOW MASTER STATUS returned no binlog file"))?
        .to_string();
    let position = row.get(1).and_then(SqlValue::as_u64).unwrap_or(0);
    // The GTID column exists only on servers with GTIDs enabled.
    let gtid_set = row
        .get(4)
        .and_then(SqlValue::as_text)
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string);

    Ok(BinlogCoordinate {
        file,
        position,
        gtid_set,
    })
}

/// Read the grants of the connector's user.
pub async fn read_user_grants<C: SnapshotConnection>(conn: &mut C) -> Result<Vec<String>> {
    let rows = conn.query("SHOW GRANTS FOR CURRENT_USER").await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.first().and_then(SqlValue::as_text))
        .map(str::to_string)
        .collect())
}

/// Log the grants of the connector's user, warning when none are
/// visible; missing privileges are the usual cause of empty snapshots.
pub async fn log_user_grants<C: SnapshotConnection>(conn: &mut C, user: &str) {
    match read_user_grants(conn).await {
        Ok(grants) if grants.is_empty() => {
            warn!(
                "snapshot is using user '{user}' but it likely does not have the required \
                 privileges; if tables are missing or empty, check the user's grants"
            );
        }
        Ok(grants) => {
            info!("snapshot is using user '{user}' with these grants:");
            for grant in grants {
                info!("\t{grant}");
            }
        }
        Err(e) => info!("cannot determine the privileges of '{user}': {e}"),
    }
}

/// Log the server settings that matter for change data capture.
pub async fn log_server_variables<C: SnapshotConnection>(conn: &mut C) {
    let result = conn
        .query(
            "SHOW VARIABLES WHERE Variable_name REGEXP \
             'version|binlog|tx_|gtid|character_set|collation|time_zone'",
        )
        .await;
    match result {
        Ok(rows) => {
            info!("server variables related to change data capture:");
            for row in rows {
                let name = row.first().and_then(SqlValue::as_text).unwrap_or("");
                let value = row.get(1).and_then(SqlValue::as_text).unwrap_or("");
                info!("\t{name} = {value}");
            }
        }
        Err(e) => info!("cannot read server variables: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::connection::MemoryConnection;

    #[tokio::test]
    async fn test_read_catalog_and_table_names() {
        let mut conn = MemoryConnection::new();
        conn.add_table("shop", "orders", "CREATE TABLE `orders` (`id` int)", vec![]);
        conn.add_table("crm", "people", "CREATE TABLE `people` (`id` int)", vec![]);

        let catalogs = read_catalog_names(&mut conn).await.unwrap();
        assert_eq!(
            catalogs.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["crm", "shop"]
        );

        let tables = read_table_names_in(&mut conn, "shop").await.unwrap();
        assert_eq!(tables, vec![TableId::new("shop", "orders")]);

        let all = read_all_table_names(&mut conn).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_charset_variables_and_set_statement() {
        let mut conn = MemoryConnection::new();
        let vars = read_charset_system_variables(&mut conn).await.unwrap();
        assert_eq!(vars.get("character_set_server").unwrap(), "utf8mb4");

        let stmt = set_statement_for(&vars);
        assert!(stmt.starts_with("SET "));
        assert!(stmt.contains("character_set_server=utf8mb4"));
        assert!(stmt.contains(", "));

        assert_eq!(set_statement_for(&BTreeMap::new()), "");
    }

    #[tokio::test]
    async fn test_binlog_coordinate() {
        let mut conn = MemoryConnection::new();
        conn.set_master_status("binlog.000042", 1021, Some("36eb5b0a:1-77"));

        let coord = read_binlog_coordinate(&mut conn).await.unwrap();
        assert_eq!(coord.file, "binlog.000042");
        assert_eq!(coord.position, 1021);
        assert_eq!(coord.gtid_set.as_deref(), Some("36eb5b0a:1-77"));
    }

    #[tokio::test]
    async fn test_binlog_disabled_is_precondition_error() {
        let mut conn = MemoryConnection::new();
        let err = read_binlog_coordinate(&mut conn).await.unwrap_err();
        assert!(matches!(err, CdcError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_read_user_grants() {
        let mut conn = MemoryConnection::new();
        conn.set_grants(vec!["GRANT SELECT ON *.* TO 'repl'".to_string()]);
        let grants = read_user_grants(&mut conn).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert!(grants[0].contains("GRANT SELECT"));
    }
}
