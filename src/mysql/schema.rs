//! In-memory schema model
//!
//! The snapshot engine rebuilds this catalog from scratch on every run by
//! replaying synthetic DDL (charset `SET`, `DROP`/`CREATE DATABASE`,
//! `USE`, and the server's own `SHOW CREATE TABLE` output) so the
//! downstream schema registry converges on the exact post-snapshot state
//! regardless of what it knew before.
//!
//! Identifier quoting matches what the server accepts: names are wrapped
//! in backticks and embedded backticks are not escaped.

use crate::common::{CdcError, Result};
use crate::mysql::source_info::SourceInfo;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Identifier of a table: catalog, optional schema, table name.
///
/// MySQL has no schema level between database and table, so the schema
/// component stays empty there; comparisons consider it only when both
/// sides carry one.
#[derive(Debug, Clone, Eq)]
pub struct TableId {
    catalog: String,
    schema: Option<String>,
    table: String,
}

impl TableId {
    /// Create an id with no schema component.
    pub fn new(catalog: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            catalog: catalog.into(),
            schema: None,
            table: table.into(),
        }
    }

    /// Create an id with a schema component.
    pub fn with_schema(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl PartialEq for TableId {
    fn eq(&self, other: &Self) -> bool {
        if self.catalog != other.catalog || self.table != other.table {
            return false;
        }
        match (&self.schema, &other.schema) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

// Hash and Ord ignore the schema component so they stay consistent with
// the up-to-non-null equality above.
impl Hash for TableId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.catalog.hash(state);
        self.table.hash(state);
    }
}

impl PartialOrd for TableId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.catalog, &self.table).cmp(&(&other.catalog, &other.table))
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.catalog, self.table)
    }
}

/// Wrap an identifier in backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

/// Quote a table reference as `` `db`.`table` ``.
pub fn quote_table(id: &TableId) -> String {
    format!("{}.{}", quote_ident(id.catalog()), quote_ident(id.table()))
}

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Source type as written, e.g. `varchar(255)`
    pub type_name: String,
    /// Whether the column accepts NULL
    pub nullable: bool,
}

/// A table definition recovered from DDL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Identifier
    pub id: TableId,
    /// Columns in definition order
    pub columns: Vec<Column>,
    /// Primary-key column names, in key order
    pub primary_key: Vec<String>,
}

impl Table {
    /// Names of all columns, in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Mutable catalog of known tables.
#[derive(Debug, Default)]
pub struct MySqlSchema {
    tables: BTreeMap<TableId, Table>,
    databases: BTreeSet<String>,
    current_database: Option<String>,
    variables: BTreeMap<String, String>,
}

impl MySqlSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table definition for `id`, if known.
    pub fn table_for(&self, id: &TableId) -> Option<&Table> {
        self.tables.get(id)
    }

    /// All known table ids.
    pub fn table_ids(&self) -> Vec<TableId> {
        self.tables.keys().cloned().collect()
    }

    /// All databases known to the model, from tracked databases and
    /// table catalogs.
    pub fn catalog_names(&self) -> BTreeSet<String> {
        let mut names = self.databases.clone();
        names.extend(self.tables.keys().map(|id| id.catalog().to_string()));
        names
    }

    /// Server variables captured from `SET` statements.
    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Parse and apply one DDL statement, then report it through
    /// `emit(database, ddl)` exactly once. Empty statements are ignored.
    ///
    /// The affected table is visible through [`table_for`](Self::table_for)
    /// atomically once this returns.
    pub fn apply_ddl<F>(
        &mut self,
        source: &SourceInfo,
        database: Option<&str>,
        ddl: &str,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(Option<&str>, &str),
    {
        let ddl = ddl.trim();
        if ddl.is_empty() {
            return Ok(());
        }
        debug!(
            server = source.server_name(),
            database = database.unwrap_or(""),
            "applying DDL: {ddl}"
        );

        let upper = ddl.to_uppercase();
        if let Some(rest) = strip_keyword(ddl, &upper, "SET ") {
            self.apply_set(rest);
        } else if let Some(rest) = strip_keyword(ddl, &upper, "DROP TABLE IF EXISTS ")
            .or_else(|| strip_keyword(ddl, &upper, "DROP TABLE "))
        {
            if let Ok((db, table)) = self.resolve_table_ref(rest, database) {
                self.tables.remove(&TableId::new(db, table));
            }
        } else if let Some(rest) = strip_keyword(ddl, &upper, "DROP DATABASE IF EXISTS ")
            .or_else(|| strip_keyword(ddl, &upper, "DROP DATABASE "))
        {
            let db = unquote(rest);
            self.databases.remove(&db);
            self.tables.retain(|id, _| id.catalog() != db);
        } else if let Some(rest) = strip_keyword(ddl, &upper, "CREATE DATABASE IF NOT EXISTS ")
            .or_else(|| strip_keyword(ddl, &upper, "CREATE DATABASE "))
        {
            self.databases.insert(unquote(rest));
        } else if let Some(rest) = strip_keyword(ddl, &upper, "USE ") {
            self.current_database = Some(unquote(rest));
        } else if strip_keyword(ddl, &upper, "CREATE TABLE ").is_some() {
            let table = self.parse_create_table(ddl, database)?;
            self.databases.insert(table.id.catalog().to_string());
            self.tables.insert(table.id.clone(), table);
        } else {
            debug!("ignoring unrecognized DDL: {ddl}");
        }

        emit(database, ddl);
        Ok(())
    }

    fn apply_set(&mut self, assignments: &str) {
        for assignment in split_top_level(assignments, ',') {
            if let Some((name, value)) = assignment.split_once('=') {
                self.variables
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }

    fn resolve_table_ref(
        &self,
        reference: &str,
        database: Option<&str>,
    ) -> Result<(String, String)> {
        let reference = reference.trim().trim_end_matches(';');
        if let Some((db, table)) = reference.split_once("`.`") {
            return Ok((unquote(db), unquote(table)));
        }
        if let Some((db, table)) = reference.split_once('.') {
            if !reference.contains('`') {
                return Ok((unquote(db), unquote(table)));
            }
        }
        let table = unquote(reference);
        let db = database
            .map(str::to_string)
            .or_else(|| self.current_database.clone())
            .ok_or_else(|| {
                CdcError::transient(format!("no database in scope for table '{table}'"))
            })?;
        Ok((db, table))
    }

    fn parse_create_table(&self, ddl: &str, database: Option<&str>) -> Result<Table> {
        let upper = ddl.to_uppercase();
        let rest = strip_keyword(ddl, &upper, "CREATE TABLE ")
            .ok_or_else(|| CdcError::transient("not a CREATE TABLE statement"))?;
        let rest = {
            let upper = rest.to_uppercase();
            strip_keyword(rest, &upper, "IF NOT EXISTS ").unwrap_or(rest)
        };

        let open = rest
            .find('(')
            .ok_or_else(|| CdcError::transient("CREATE TABLE without column list"))?;
        let (db, table) = self.resolve_table_ref(&rest[..open], database)?;
        let body = paren_body(&rest[open..])
            .ok_or_else(|| CdcError::transient("unbalanced CREATE TABLE column list"))?;

        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        for definition in split_top_level(body, ',') {
            let definition = definition.trim();
            if definition.is_empty() {
                continue;
            }
            let upper = definition.to_uppercase();
            if upper.starts_with("PRIMARY KEY") {
                if let Some(open) = definition.find('(') {
                    if let Some(cols) = paren_body(&definition[open..]) {
                        primary_key
                            .extend(split_top_level(cols, ',').iter().map(|c| unquote(c)));
                    }
                }
                continue;
            }
            if ["UNIQUE", "KEY", "INDEX", "CONSTRAINT", "FOREIGN", "CHECK", "FULLTEXT", "SPATIAL"]
                .iter()
                .any(|kw| upper.starts_with(kw))
            {
                continue;
            }

            let (name, after_name) = take_identifier(definition);
            if name.is_empty() {
                continue;
            }
            let type_name = take_type(after_name);
            if upper.contains("PRIMARY KEY") {
                primary_key.push(name.clone());
            }
            columns.push(Column {
                name,
                nullable: !upper.contains("NOT NULL"),
                type_name,
            });
        }

        Ok(Table {
            id: TableId::new(db, table),
            columns,
            primary_key,
        })
    }
}

/// Case-insensitive prefix strip; returns the remainder on a match.
fn strip_keyword<'a>(original: &'a str, upper: &str, keyword: &str) -> Option<&'a str> {
    if upper.starts_with(keyword) {
        Some(original[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Strip backticks from one identifier.
fn unquote(ident: &str) -> String {
    ident.trim().trim_end_matches(';').trim_matches('`').to_string()
}

/// Contents of the parenthesized group starting at `text` (which must
/// begin with `(`), honoring nesting, backticks, and quoted strings.
fn paren_body(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_backtick = false;
    let mut in_quote = false;
    for (i, c) in text.char_indices() {
        match c {
            '`' if !in_quote => in_backtick = !in_backtick,
            '\'' if !in_backtick => in_quote = !in_quote,
            '(' if !in_backtick && !in_quote => depth += 1,
            ')' if !in_backtick && !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `separator` at paren depth zero, outside backticks and
/// quoted strings.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_backtick = false;
    let mut in_quote = false;
    let mut start = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '`' if !in_quote => in_backtick = !in_backtick,
            '\'' if !in_backtick => in_quote = !in_quote,
            '(' if !in_backtick && !in_quote => depth += 1,
            ')' if !in_backtick && !in_quote => depth = depth.saturating_sub(1),
            c if c == separator && depth == 0 && !in_backtick && !in_quote => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Read a leading identifier (backticked or bare) and return it with the
/// rest of the input.
fn take_identifier(text: &str) -> (String, &str) {
    let text = text.trim_start();
    if let Some(stripped) = text.strip_prefix('`') {
        if let Some(end) = stripped.find('`') {
            return (stripped[..end].to_string(), &stripped[end + 1..]);
        }
    }
    let end = text
        .find(char::is_whitespace)
        .unwrap_or(text.len());
    (text[..end].to_string(), &text[end..])
}

/// Read a type token such as `varchar(255)` or `decimal(10,2)`.
fn take_type(text: &str) -> String {
    let text = text.trim_start();
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 => return text[..i].to_string(),
            _ => {}
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceInfo {
        SourceInfo::new("test")
    }

    fn apply(schema: &mut MySqlSchema, db: Option<&str>, ddl: &str) {
        schema.apply_ddl(&source(), db, ddl, |_, _| {}).unwrap();
    }

    #[test]
    fn test_table_id_equality_up_to_schema() {
        let plain = TableId::new("shop", "orders");
        let with_schema = TableId::with_schema("shop", "public", "orders");
        let other_schema = TableId::with_schema("shop", "private", "orders");

        assert_eq!(plain, with_schema);
        assert_ne!(with_schema, other_schema);
        assert_ne!(plain, TableId::new("shop", "invoices"));
        assert_eq!(plain.to_string(), "shop.orders");
    }

    #[test]
    fn test_quoting_is_unescaped_backticks() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(
            quote_table(&TableId::new("shop", "orders")),
            "`shop`.`orders`"
        );
    }

    #[test]
    fn test_create_table_with_inline_primary_key() {
        let mut schema = MySqlSchema::new();
        apply(&mut schema, Some("shop"), "USE `shop`");
        apply(
            &mut schema,
            Some("shop"),
            "CREATE TABLE `orders` (\n  `id` int NOT NULL PRIMARY KEY,\n  `note` varchar(255)\n)",
        );

        let table = schema.table_for(&TableId::new("shop", "orders")).unwrap();
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns[0].name, "id");
        assert!(!table.columns[0].nullable);
        assert_eq!(table.columns[1].type_name, "varchar(255)");
        assert!(table.columns[1].nullable);
        assert_eq!(table.primary_key, vec!["id"]);
    }

    #[test]
    fn test_create_table_with_key_constraint() {
        let mut schema = MySqlSchema::new();
        apply(
            &mut schema,
            Some("shop"),
            "CREATE TABLE `shop`.`line_items` (\
             `order_id` int NOT NULL, \
             `line_no` int NOT NULL, \
             `price` decimal(10,2) NOT NULL, \
             `status` enum('new','paid') DEFAULT 'new', \
             PRIMARY KEY (`order_id`, `line_no`), \
             KEY `by_status` (`status`))",
        );

        let table = schema
            .table_for(&TableId::new("shop", "line_items"))
            .unwrap();
        assert_eq!(table.columns.len(), 4);
        assert_eq!(table.columns[2].type_name, "decimal(10,2)");
        assert_eq!(table.columns[3].type_name, "enum('new','paid')");
        assert_eq!(table.primary_key, vec!["order_id", "line_no"]);
    }

    #[test]
    fn test_drop_table_and_database() {
        let mut schema = MySqlSchema::new();
        apply(&mut schema, Some("shop"), "CREATE TABLE `shop`.`a` (`id` int)");
        apply(&mut schema, Some("shop"), "CREATE TABLE `shop`.`b` (`id` int)");
        assert_eq!(schema.table_ids().len(), 2);

        apply(&mut schema, Some("shop"), "DROP TABLE IF EXISTS `shop`.`a`");
        assert!(schema.table_for(&TableId::new("shop", "a")).is_none());
        assert!(schema.table_for(&TableId::new("shop", "b")).is_some());

        apply(&mut schema, Some("shop"), "DROP DATABASE IF EXISTS `shop`");
        assert!(schema.table_ids().is_empty());
        assert!(schema.catalog_names().is_empty());
    }

    #[test]
    fn test_set_statement_captured() {
        let mut schema = MySqlSchema::new();
        apply(
            &mut schema,
            None,
            "SET character_set_server=utf8mb4, collation_server=utf8mb4_0900_ai_ci",
        );
        assert_eq!(
            schema.variables().get("character_set_server").unwrap(),
            "utf8mb4"
        );
    }

    #[test]
    fn test_emitter_called_once_per_statement() {
        let mut schema = MySqlSchema::new();
        let mut seen = Vec::new();
        schema
            .apply_ddl(&source(), Some("shop"), "CREATE DATABASE `shop`", |db, ddl| {
                seen.push((db.map(str::to_string), ddl.to_string()));
            })
            .unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "CREATE DATABASE `shop`");

        // Empty DDL applies nothing and emits nothing.
        schema
            .apply_ddl(&source(), None, "   ", |_, _| panic!("must not emit"))
            .unwrap();
    }

    #[test]
    fn test_use_scopes_unqualified_create() {
        let mut schema = MySqlSchema::new();
        apply(&mut schema, Some("crm"), "USE `crm`");
        apply(&mut schema, None, "CREATE TABLE `people` (`id` int NOT NULL)");

        assert!(schema.table_for(&TableId::new("crm", "people")).is_some());
    }
}
