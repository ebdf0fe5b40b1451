//! Per-engine SQL dialect catalog.
//!
//! One static [`Dialect`] record per supported engine holds the SQL
//! templates that implement load strategies via staging tables, plus
//! identifier-escaping rules and terminal metadata. Templates are pure
//! string formats with positional placeholders (`{1}` destination table,
//! `{2}` staging table, `{3}` primary key) and are never concatenated
//! with unescaped user input.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::schema::Table;

/// Supported database engines, resolved once at connection-open time and
/// carried alongside the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    MySql,
    Postgres,
    Redshift,
    Snowflake,
    Sqlite,
}

impl Engine {
    /// The dialect record for this engine.
    pub fn dialect(self) -> &'static Dialect {
        match self {
            Engine::MySql => &MYSQL,
            Engine::Postgres => &POSTGRES,
            Engine::Redshift => &REDSHIFT,
            Engine::Snowflake => &SNOWFLAKE,
            Engine::Sqlite => &SQLITE,
        }
    }

    /// Resolve an engine from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split("://").next()?;
        match scheme {
            "mysql" => Some(Engine::MySql),
            "postgres" | "postgresql" => Some(Engine::Postgres),
            "redshift" => Some(Engine::Redshift),
            "snowflake" => Some(Engine::Snowflake),
            "sqlite" | "sqlite3" => Some(Engine::Sqlite),
            _ => None,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dialect().key)
    }
}

/// Static, read-only record of SQL templates for one database engine.
#[derive(Debug)]
pub struct Dialect {
    /// Short identifier ("postgres", "snowflake", ...).
    pub key: &'static str,

    /// Human-readable engine name.
    pub human_name: &'static str,

    /// Interactive terminal/REPL command, empty when none applies.
    pub terminal_command: &'static str,

    /// Create an empty staging table structurally identical to `{1}`.
    pub create_staging_table_query: &'static str,

    /// Atomically replace destination contents with staging contents.
    pub full_load_query: &'static str,

    /// Append staging rows to the destination (watermark-filtered upstream).
    pub incremental_load_query: &'static str,

    /// Upsert destination rows whose primary key appears in staging.
    /// Empty for engines that build the statement dynamically (Snowflake).
    pub modified_only_load_query: &'static str,

    /// Set the active schema for a session.
    pub set_schema_query: &'static str,

    /// Identifier quoting character, doubled to escape itself.
    quote: char,
}

static MYSQL: Dialect = Dialect {
    key: "mysql",
    human_name: "MySQL",
    terminal_command: "mysql",
    create_staging_table_query: "CREATE TABLE {2} LIKE {1}",
    full_load_query: "DELETE FROM {1}; INSERT INTO {1} SELECT * FROM {2}",
    incremental_load_query: "INSERT INTO {1} SELECT * FROM {2}",
    modified_only_load_query: "DELETE FROM {1} WHERE {3} IN (SELECT {3} FROM {2}); INSERT INTO {1} SELECT * FROM {2}",
    set_schema_query: "USE {1}",
    quote: '`',
};

static POSTGRES: Dialect = Dialect {
    key: "postgres",
    human_name: "PostgreSQL",
    terminal_command: "psql",
    create_staging_table_query: "CREATE TABLE {2} AS TABLE {1} WITH NO DATA",
    full_load_query: "DELETE FROM {1}; INSERT INTO {1} SELECT * FROM {2}",
    incremental_load_query: "INSERT INTO {1} SELECT * FROM {2}",
    modified_only_load_query: "DELETE FROM {1} WHERE {3} IN (SELECT {3} FROM {2}); INSERT INTO {1} SELECT * FROM {2}",
    set_schema_query: "SET search_path TO {1}",
    quote: '"',
};

static REDSHIFT: Dialect = Dialect {
    key: "redshift",
    human_name: "AWS RedShift",
    terminal_command: "psql",
    create_staging_table_query: "CREATE TEMPORARY TABLE {2} (LIKE {1})",
    full_load_query: "DELETE FROM {1}; INSERT INTO {1} SELECT * FROM {2}",
    incremental_load_query: "INSERT INTO {1} SELECT * FROM {2}",
    modified_only_load_query: "DELETE FROM {1} USING {2} WHERE {1}.{3} = {2}.{3}; INSERT INTO {1} SELECT * FROM {2}",
    set_schema_query: "SET search_path TO {1}",
    quote: '"',
};

static SNOWFLAKE: Dialect = Dialect {
    key: "snowflake",
    human_name: "Snowflake",
    terminal_command: "snowsql",
    create_staging_table_query: "CREATE TEMPORARY TABLE {2} LIKE {1}",
    full_load_query: "TRUNCATE TABLE {1}; INSERT INTO {1} SELECT * FROM {2}",
    incremental_load_query: "INSERT INTO {1} SELECT * FROM {2}",
    // Built column-by-column from the destination table; see
    // [`Dialect::render_merge_query`].
    modified_only_load_query: "",
    set_schema_query: "USE SCHEMA {1}",
    quote: '"',
};

static SQLITE: Dialect = Dialect {
    key: "sqlite",
    human_name: "SQLite3",
    terminal_command: "sqlite3",
    create_staging_table_query: "CREATE TABLE {2} AS SELECT * FROM {1} LIMIT 0",
    full_load_query: "DELETE FROM {1}; INSERT INTO {1} SELECT * FROM {2}",
    incremental_load_query: "INSERT INTO {1} SELECT * FROM {2}",
    modified_only_load_query: "DELETE FROM {1} WHERE {3} IN (SELECT {3} FROM {2}); INSERT INTO {1} SELECT * FROM {2}",
    set_schema_query: "",
    quote: '"',
};

/// Select a dialect from a driver identity string.
///
/// Unrecognized drivers fall back to the MySQL dialect with a warning.
/// This is a deliberate, documented policy carried over from the original
/// tool, not an error path.
pub fn select_dialect(driver: &str) -> &'static Dialect {
    match driver {
        "mysql" => &MYSQL,
        "postgres" | "postgresql" => &POSTGRES,
        "redshift" => &REDSHIFT,
        "snowflake" => &SNOWFLAKE,
        "sqlite" | "sqlite3" => &SQLITE,
        other => {
            warn!(driver = other, "unrecognized driver, defaulting to MySQL dialect");
            &MYSQL
        }
    }
}

impl Dialect {
    /// Escape an identifier per this dialect's quoting rule.
    ///
    /// Plain lowercase identifiers (`[a-z_][a-z0-9_]*`) pass through
    /// unquoted so generated DDL stays readable; anything else is quoted
    /// with the dialect's quote character, doubling embedded quotes.
    pub fn escape_identifier(&self, name: &str) -> String {
        let plain = !name.is_empty()
            && name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if plain {
            return name.to_string();
        }
        let doubled = name.replace(self.quote, &format!("{0}{0}", self.quote));
        format!("{0}{1}{0}", self.quote, doubled)
    }

    /// Render the staging-table creation statement.
    pub fn render_create_staging(&self, destination: &str, staging: &str) -> Result<String> {
        self.render(self.create_staging_table_query, destination, staging, "")
    }

    /// Render the full-load statement: atomically replace destination
    /// contents with staging contents.
    pub fn render_full_load(&self, destination: &str, staging: &str) -> Result<String> {
        self.render(self.full_load_query, destination, staging, "")
    }

    /// Render the incremental-load statement: append staging rows.
    pub fn render_incremental_load(&self, destination: &str, staging: &str) -> Result<String> {
        self.render(self.incremental_load_query, destination, staging, "")
    }

    /// Render the modified-only merge: upsert destination rows whose
    /// primary key appears in staging. Updates and inserts, never deletes.
    ///
    /// Snowflake builds a MERGE statement column-by-column from the
    /// destination table in column order; the other engines fill a fixed
    /// delete-then-insert template.
    pub fn render_modified_only_load(
        &self,
        destination_table: &Table,
        destination: &str,
        staging: &str,
        primary_key: &str,
    ) -> Result<String> {
        if self.key == SNOWFLAKE.key {
            return Ok(self.render_merge_query(destination_table, destination, staging, primary_key));
        }
        self.render(self.modified_only_load_query, destination, staging, primary_key)
    }

    /// Render the session schema statement.
    pub fn render_set_schema(&self, schema: &str) -> Result<String> {
        self.render(self.set_schema_query, schema, "", "")
    }

    /// Build a Snowflake-style MERGE from the destination column list.
    ///
    /// Produces exactly one assignment clause and one column/value pair per
    /// destination column, comma-joined with no leading or trailing
    /// separator. A destination with zero columns renders without error.
    pub fn render_merge_query(
        &self,
        destination_table: &Table,
        destination: &str,
        staging: &str,
        primary_key: &str,
    ) -> String {
        let dest = self.escape_identifier(destination);
        let stage = self.escape_identifier(staging);
        let pk = self.escape_identifier(primary_key);

        let mut assignments = Vec::with_capacity(destination_table.columns.len());
        let mut insert_columns = Vec::with_capacity(destination_table.columns.len());
        let mut insert_values = Vec::with_capacity(destination_table.columns.len());
        for column in &destination_table.columns {
            let name = self.escape_identifier(&column.name);
            assignments.push(format!("{dest}.{name} = {stage}.{name}"));
            insert_columns.push(name.clone());
            insert_values.push(format!("{stage}.{name}"));
        }

        format!(
            "MERGE INTO {dest} USING {stage} ON {dest}.{pk} = {stage}.{pk}\n\
             WHEN MATCHED THEN UPDATE SET\n{}\n\
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({})",
            assignments.join(", "),
            insert_columns.join(", "),
            insert_values.join(", "),
        )
    }

    fn render(
        &self,
        template: &str,
        destination: &str,
        staging: &str,
        primary_key: &str,
    ) -> Result<String> {
        if template.is_empty() {
            return Err(SyncError::Config(format!(
                "operation not supported by the {} dialect",
                self.human_name
            )));
        }
        Ok(template
            .replace("{1}", &self.escape_identifier(destination))
            .replace("{2}", &self.escape_identifier(staging))
            .replace("{3}", &self.escape_identifier(primary_key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, ColumnOption, DataType};

    fn widgets_destination() -> Table {
        Table::new(
            "source",
            "widgets",
            vec![
                Column::new("id", DataType::Integer).with_option(ColumnOption::Bytes, 8),
                Column::new("name", DataType::String).with_option(ColumnOption::Length, 255),
                Column::new("active", DataType::Boolean),
            ],
        )
    }

    #[test]
    fn test_select_dialect_known_drivers() {
        assert_eq!(select_dialect("postgres").key, "postgres");
        assert_eq!(select_dialect("sqlite3").key, "sqlite");
        assert_eq!(select_dialect("redshift").key, "redshift");
        assert_eq!(select_dialect("snowflake").key, "snowflake");
    }

    #[test]
    fn test_select_dialect_defaults_to_mysql() {
        assert_eq!(select_dialect("oracle").key, "mysql");
        assert_eq!(select_dialect("").key, "mysql");
    }

    #[test]
    fn test_engine_from_url() {
        assert_eq!(Engine::from_url("postgres://u@h/db"), Some(Engine::Postgres));
        assert_eq!(Engine::from_url("sqlite3://file.db"), Some(Engine::Sqlite));
        assert_eq!(Engine::from_url("oracle://u@h/db"), None);
    }

    #[test]
    fn test_full_load_template_is_bit_exact() {
        let sql = POSTGRES.render_full_load("dest", "stage").unwrap();
        assert_eq!(sql, "DELETE FROM dest; INSERT INTO dest SELECT * FROM stage");

        let sql = SNOWFLAKE.render_full_load("dest", "stage").unwrap();
        assert_eq!(sql, "TRUNCATE TABLE dest; INSERT INTO dest SELECT * FROM stage");
    }

    #[test]
    fn test_modified_only_templates() {
        let table = widgets_destination();
        let sql = POSTGRES
            .render_modified_only_load(&table, "dest", "stage", "id")
            .unwrap();
        assert_eq!(
            sql,
            "DELETE FROM dest WHERE id IN (SELECT id FROM stage); INSERT INTO dest SELECT * FROM stage"
        );

        let sql = REDSHIFT
            .render_modified_only_load(&table, "dest", "stage", "id")
            .unwrap();
        assert_eq!(
            sql,
            "DELETE FROM dest USING stage WHERE dest.id = stage.id; INSERT INTO dest SELECT * FROM stage"
        );
    }

    #[test]
    fn test_merge_query_well_formed() {
        let table = widgets_destination();
        let sql = SNOWFLAKE.render_merge_query(&table, "dest", "stage", "id");

        assert!(sql.starts_with("MERGE INTO dest USING stage ON dest.id = stage.id"));
        assert!(sql.contains(
            "WHEN MATCHED THEN UPDATE SET\ndest.id = stage.id, dest.name = stage.name, dest.active = stage.active"
        ));
        assert!(sql.contains("WHEN NOT MATCHED THEN INSERT (id, name, active) VALUES (stage.id, stage.name, stage.active)"));

        // Exactly N assignment clauses (plus the ON join), no leading or
        // trailing separators.
        assert_eq!(sql.matches(" = stage.").count(), 1 + 3);
        assert!(!sql.contains(", \n WHEN"));
        assert!(!sql.contains(",,"));
        assert!(!sql.contains("(, "));
        assert!(!sql.contains(", )"));
    }

    #[test]
    fn test_merge_query_zero_columns() {
        let table = Table::new("source", "empty", vec![]);
        let sql = SNOWFLAKE.render_merge_query(&table, "dest", "stage", "id");
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET\n\n"));
        assert!(sql.contains("INSERT () VALUES ()"));
    }

    #[test]
    fn test_merge_query_escapes_identifiers() {
        let table = Table::new(
            "source",
            "t",
            vec![Column::new("Mixed Case", DataType::Text)],
        );
        let sql = SNOWFLAKE.render_merge_query(&table, "dest", "stage", "id");
        assert!(sql.contains("dest.\"Mixed Case\" = stage.\"Mixed Case\""));
    }

    #[test]
    fn test_escape_identifier() {
        assert_eq!(POSTGRES.escape_identifier("widgets"), "widgets");
        assert_eq!(POSTGRES.escape_identifier("my_table2"), "my_table2");
        assert_eq!(POSTGRES.escape_identifier("Widgets"), "\"Widgets\"");
        assert_eq!(POSTGRES.escape_identifier("has space"), "\"has space\"");
        assert_eq!(POSTGRES.escape_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(MYSQL.escape_identifier("Widgets"), "`Widgets`");
        assert_eq!(POSTGRES.escape_identifier("2fast"), "\"2fast\"");
    }

    #[test]
    fn test_empty_template_is_config_error() {
        assert!(SQLITE.render_set_schema("main").is_err());
    }

    #[test]
    fn test_set_schema() {
        assert_eq!(
            POSTGRES.render_set_schema("analytics").unwrap(),
            "SET search_path TO analytics"
        );
        assert_eq!(SNOWFLAKE.render_set_schema("analytics").unwrap(), "USE SCHEMA analytics");
    }
}
