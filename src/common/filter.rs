//! Table, column, and GTID-source filtering
//!
//! Include/exclude lists from the configuration are compiled once into
//! anchored, case-sensitive regex predicates over fully-qualified names
//! (`db`, `db.table`, `db.table.column`). Include and exclude lists on
//! the same dimension are mutually exclusive; configuration validation
//! rejects both being set.
//!
//! Built-in system databases are excluded by default so a snapshot never
//! traverses `mysql`, `information_schema`, `performance_schema`, or
//! `sys`.

use crate::common::{CdcConfig, CdcError, Result};
use regex::Regex;

/// Databases that ship with the server and never carry user data.
pub const BUILTIN_DATABASES: [&str; 4] = [
    "mysql",
    "information_schema",
    "performance_schema",
    "sys",
];

/// True when `name` is one of the server's built-in databases.
pub fn is_builtin_database(name: &str) -> bool {
    let lower = name.to_lowercase();
    BUILTIN_DATABASES.iter().any(|b| *b == lower)
}

/// One include-or-exclude dimension compiled to regexes.
#[derive(Debug)]
enum ListPredicate {
    /// No list configured; everything matches.
    All,
    /// Only names matching one of the patterns pass.
    Include(Vec<Regex>),
    /// Names matching one of the patterns are dropped.
    Exclude(Vec<Regex>),
}

impl ListPredicate {
    fn compile(
        dimension: &str,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(CdcError::config(format!(
                "{dimension} include and exclude lists are mutually exclusive"
            )));
        }
        if !include.is_empty() {
            return Ok(Self::Include(Self::compile_patterns(dimension, include)?));
        }
        if !exclude.is_empty() {
            return Ok(Self::Exclude(Self::compile_patterns(dimension, exclude)?));
        }
        Ok(Self::All)
    }

    fn compile_patterns(dimension: &str, patterns: &[String]) -> Result<Vec<Regex>> {
        patterns
            .iter()
            .map(|p| {
                // Anchored full match over the qualified name.
                Regex::new(&format!("^(?:{p})$")).map_err(|e| {
                    CdcError::config(format!("invalid {dimension} pattern '{p}': {e}"))
                })
            })
            .collect()
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include(patterns) => patterns.iter().any(|r| r.is_match(name)),
            Self::Exclude(patterns) => !patterns.iter().any(|r| r.is_match(name)),
        }
    }
}

/// Compiled filter set gating which databases, tables, columns, and GTID
/// sources the connector captures.
#[derive(Debug)]
pub struct Filters {
    databases: ListPredicate,
    tables: ListPredicate,
    columns: ListPredicate,
    gtid_sources: ListPredicate,
    ignore_builtin: bool,
}

impl Filters {
    /// Compile the filter set from the connector configuration.
    pub fn new(config: &CdcConfig) -> Result<Self> {
        Ok(Self {
            databases: ListPredicate::compile(
                "database",
                &config.database_include_list,
                &config.database_exclude_list,
            )?,
            tables: ListPredicate::compile(
                "table",
                &config.table_include_list,
                &config.table_exclude_list,
            )?,
            columns: ListPredicate::compile("column", &[], &config.column_exclude_list)?,
            gtid_sources: ListPredicate::compile(
                "gtid source",
                &config.gtid_source_include_list,
                &config.gtid_source_exclude_list,
            )?,
            ignore_builtin: config.ignore_builtin_databases,
        })
    }

    /// Should `database` be captured?
    pub fn database_filter(&self, database: &str) -> bool {
        if self.ignore_builtin && is_builtin_database(database) {
            return false;
        }
        self.databases.matches(database)
    }

    /// Should the table `catalog.table` be captured? Implies the database
    /// filter.
    pub fn table_filter(&self, catalog: &str, table: &str) -> bool {
        self.database_filter(catalog) && self.tables.matches(&format!("{catalog}.{table}"))
    }

    /// Should the column be included in event values?
    pub fn column_filter(&self, catalog: &str, table: &str, column: &str) -> bool {
        self.columns.matches(&format!("{catalog}.{table}.{column}"))
    }

    /// Should transactions originating at this GTID source UUID be kept?
    pub fn gtid_source_filter(&self, source_uuid: &str) -> bool {
        self.gtid_sources.matches(source_uuid)
    }
}
