//! Canonical schema representation and per-dialect type rendering.
//!
//! Tables and columns are held in a database-agnostic form: a canonical
//! [`DataType`] plus sizing options. Dialect-native type strings parse into
//! that form via [`parse_database_type`], and render back deterministically
//! through [`Column::render_ddl`], so a type string accepted by the parser
//! round-trips to the same canonical representation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dialect::Dialect;
use crate::error::{Result, SyncError};

/// Canonical column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Integer,
    Float,
    Decimal,
    String,
    Text,
    Boolean,
    Date,
    Timestamp,
}

/// Sizing and marker options attached to a column.
///
/// Only the keys meaningful for the column's [`DataType`] are present:
/// `Bytes` for integers and floats, `Length` for strings, `Precision` and
/// `Scale` for decimals. `Computed` marks script-derived columns on any
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnOption {
    Bytes,
    Length,
    Precision,
    Scale,
    Computed,
}

/// Column metadata in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Canonical data type.
    pub data_type: DataType,

    /// Sizing options, keyed by [`ColumnOption`]. Ordered map so
    /// rendering is deterministic.
    #[serde(default)]
    pub options: BTreeMap<ColumnOption, i64>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, option: ColumnOption, value: i64) -> Self {
        self.options.insert(option, value);
        self
    }

    fn opt(&self, option: ColumnOption) -> Option<i64> {
        self.options.get(&option).copied()
    }

    /// Whether this column was derived by an extract script.
    pub fn is_computed(&self) -> bool {
        self.options.contains_key(&ColumnOption::Computed)
    }

    /// Render the column's type as dialect-portable DDL.
    ///
    /// Deterministic: the same column always renders identically, and the
    /// output re-parses to the same canonical type and options.
    pub fn render_ddl(&self) -> String {
        match self.data_type {
            DataType::Integer => match self.opt(ColumnOption::Bytes) {
                Some(2) => "INT2".to_string(),
                Some(8) => "INT8".to_string(),
                _ => "INT4".to_string(),
            },
            DataType::Float => match self.opt(ColumnOption::Bytes) {
                Some(4) => "FLOAT4".to_string(),
                _ => "FLOAT8".to_string(),
            },
            DataType::Decimal => {
                match (self.opt(ColumnOption::Precision), self.opt(ColumnOption::Scale)) {
                    (Some(p), Some(s)) => format!("DECIMAL({},{})", p, s),
                    (Some(p), None) => format!("DECIMAL({})", p),
                    _ => "DECIMAL".to_string(),
                }
            }
            DataType::String => match self.opt(ColumnOption::Length) {
                Some(n) => format!("VARCHAR({})", n),
                None => "VARCHAR(255)".to_string(),
            },
            DataType::Text => "TEXT".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
            DataType::Date => "DATE".to_string(),
            DataType::Timestamp => "TIMESTAMP".to_string(),
        }
    }
}

/// Table metadata: source name, table name, ordered columns.
///
/// Column order is significant; it defines positional INSERT/COPY column
/// lists. Built once per run by introspection or an explicit definition,
/// then treated as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Registry name of the source the table belongs to.
    pub source: String,

    /// Table name in the source.
    pub name: String,

    /// Column definitions, in source order.
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(source: impl Into<String>, name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            source: source.into(),
            name: name.into(),
            columns,
        }
    }

    /// Destination table name for this source table (`{source}_{name}`).
    pub fn destination_name(&self) -> String {
        format!("{}_{}", self.source, self.name)
    }

    /// Column names in table order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Generate a CREATE TABLE statement for this table.
    ///
    /// The table name and every column name pass through the dialect's
    /// identifier-escaping rule; column types render via
    /// [`Column::render_ddl`].
    pub fn create_statement(&self, table_name: &str, dialect: &Dialect) -> String {
        let mut statement = format!("CREATE TABLE {} (\n", dialect.escape_identifier(table_name));
        let rendered: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", dialect.escape_identifier(&c.name), c.render_ddl()))
            .collect();
        statement.push_str(&rendered.join(",\n"));
        statement.push_str("\n);");
        statement
    }
}

/// Parse a dialect-native type string into canonical form.
///
/// Accepts both the short portable spellings (`INT8`, `VARCHAR(255)`,
/// `DECIMAL(10,2)`) and the long forms returned by introspection
/// (`character varying(255)`, `timestamp without time zone`). Unrecognized
/// syntax is a hard [`SyncError::TypeParse`]; callers must not silently
/// default, so destination DDL is never wrong.
pub fn parse_database_type(
    column: &str,
    type_str: &str,
) -> Result<(DataType, BTreeMap<ColumnOption, i64>)> {
    let normalized = type_str.trim().to_uppercase();
    let mut options = BTreeMap::new();

    let parse_err = || SyncError::TypeParse {
        column: column.to_string(),
        type_str: type_str.to_string(),
    };

    let (base, args) = split_type_args(&normalized).ok_or_else(parse_err)?;

    let data_type = match base {
        "TINYINT" | "SMALLINT" | "INT2" => {
            options.insert(ColumnOption::Bytes, 2);
            DataType::Integer
        }
        "INT" | "INTEGER" | "INT4" | "MEDIUMINT" | "SERIAL" => {
            options.insert(ColumnOption::Bytes, 4);
            DataType::Integer
        }
        "BIGINT" | "INT8" | "BIGSERIAL" => {
            options.insert(ColumnOption::Bytes, 8);
            DataType::Integer
        }
        "REAL" | "FLOAT4" => {
            options.insert(ColumnOption::Bytes, 4);
            DataType::Float
        }
        "FLOAT" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
            options.insert(ColumnOption::Bytes, 8);
            DataType::Float
        }
        "DECIMAL" | "NUMERIC" | "NUMBER" => {
            match args.len() {
                0 => {}
                1 => {
                    options.insert(ColumnOption::Precision, args[0]);
                }
                2 => {
                    options.insert(ColumnOption::Precision, args[0]);
                    options.insert(ColumnOption::Scale, args[1]);
                }
                _ => return Err(parse_err()),
            }
            DataType::Decimal
        }
        "VARCHAR" | "NVARCHAR" | "CHARACTER VARYING" | "CHAR" | "NCHAR" | "CHARACTER" => {
            match args.len() {
                0 => DataType::Text,
                1 => {
                    options.insert(ColumnOption::Length, args[0]);
                    DataType::String
                }
                _ => return Err(parse_err()),
            }
        }
        "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" => DataType::Text,
        "BOOLEAN" | "BOOL" => DataType::Boolean,
        "DATE" => DataType::Date,
        "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIMESTAMP WITHOUT TIME ZONE"
        | "TIMESTAMP WITH TIME ZONE" => DataType::Timestamp,
        _ => return Err(parse_err()),
    };

    if !args.is_empty()
        && !matches!(
            data_type,
            DataType::Decimal | DataType::String | DataType::Text
        )
    {
        return Err(parse_err());
    }

    Ok((data_type, options))
}

/// Split `BASE(a,b)` into the base name and numeric arguments. A
/// non-numeric argument is `None`: `DECIMAL(banana)` and `VARCHAR(MAX)`
/// must surface as parse errors, not lose their sizing silently.
fn split_type_args(normalized: &str) -> Option<(&str, Vec<i64>)> {
    let Some(open) = normalized.find('(') else {
        return Some((normalized.trim(), Vec::new()));
    };
    let Some(close) = normalized.rfind(')') else {
        // Unbalanced parens fall through to the unknown-type error with an
        // impossible base name.
        return Some((normalized, Vec::new()));
    };
    let base = normalized[..open].trim();
    let mut args = Vec::new();
    for arg in normalized[open + 1..close].split(',') {
        args.push(arg.trim().parse::<i64>().ok()?);
    }
    Some((base, args))
}

/// Columns present in both tables, in destination order: the load set.
///
/// One-sided columns are excluded, not failed: source-only columns are
/// dropped from the extract, destination-only columns are left to the
/// destination's defaults. Both cases are logged. Destination columns
/// narrower than their source counterpart are also logged.
pub fn importable_columns(destination: &Table, source: &Table) -> Vec<Column> {
    for column in &destination.columns {
        if !source.contains_column(&column.name) {
            warn!(
                column = %column.name,
                "destination table column excluded from extract (not present in source)"
            );
        }
    }
    for column in &source.columns {
        if !destination.contains_column(&column.name) {
            warn!(
                column = %column.name,
                "source table column excluded from extract (not present in destination)"
            );
        }
    }

    let both: Vec<Column> = destination
        .columns
        .iter()
        .filter(|c| source.contains_column(&c.name))
        .cloned()
        .collect();

    for dest_column in &both {
        let source_column = source
            .columns
            .iter()
            .find(|c| c.name == dest_column.name)
            .expect("column present in both tables");
        check_column_width(dest_column, source_column);
    }

    both
}

fn check_column_width(destination: &Column, source: &Column) {
    let narrower = |option: ColumnOption| {
        source.options.get(&option).copied().unwrap_or(0)
            > destination.options.get(&option).copied().unwrap_or(0)
    };
    match destination.data_type {
        DataType::String if narrower(ColumnOption::Length) => {
            warn!(column = %source.name, "destination LENGTH is too short for string column");
        }
        DataType::Integer if narrower(ColumnOption::Bytes) => {
            warn!(column = %source.name, "destination BYTES is too small for integer column");
        }
        DataType::Decimal if narrower(ColumnOption::Precision) => {
            warn!(column = %source.name, "destination PRECISION is too small for numeric column");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Engine;

    fn squish(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub(crate) fn widgets_table() -> Table {
        Table::new(
            "source",
            "widgets",
            vec![
                Column::new("id", DataType::Integer).with_option(ColumnOption::Bytes, 8),
                Column::new("name", DataType::String).with_option(ColumnOption::Length, 255),
                Column::new("active", DataType::Boolean),
                Column::new("price", DataType::Decimal)
                    .with_option(ColumnOption::Precision, 10)
                    .with_option(ColumnOption::Scale, 2),
            ],
        )
    }

    #[test]
    fn test_generate_create_table_statement() {
        let table = widgets_table();
        let dialect = Engine::Postgres.dialect();
        let expected = squish(
            "CREATE TABLE source_widgets (
                id INT8,
                name VARCHAR(255),
                active BOOLEAN,
                price DECIMAL(10,2)
            );",
        );
        assert_eq!(expected, squish(&table.create_statement("source_widgets", dialect)));
    }

    #[test]
    fn test_create_table_statement_escapes_identifiers() {
        let table = Table::new(
            "source",
            "widgets",
            vec![Column::new("select", DataType::Text)],
        );
        let dialect = Engine::Postgres.dialect();
        let statement = table.create_statement("Weird Name", dialect);
        assert!(statement.contains("\"Weird Name\""));
        // Plain lowercase identifiers pass through unquoted.
        assert!(statement.contains("select TEXT"));
    }

    #[test]
    fn test_parse_database_type_integers() {
        let (dt, opts) = parse_database_type("id", "INT8").unwrap();
        assert_eq!(dt, DataType::Integer);
        assert_eq!(opts.get(&ColumnOption::Bytes), Some(&8));

        let (dt, opts) = parse_database_type("id", "integer").unwrap();
        assert_eq!(dt, DataType::Integer);
        assert_eq!(opts.get(&ColumnOption::Bytes), Some(&4));

        let (dt, opts) = parse_database_type("id", "smallint").unwrap();
        assert_eq!(dt, DataType::Integer);
        assert_eq!(opts.get(&ColumnOption::Bytes), Some(&2));
    }

    #[test]
    fn test_parse_database_type_strings_and_decimals() {
        let (dt, opts) = parse_database_type("name", "VARCHAR(255)").unwrap();
        assert_eq!(dt, DataType::String);
        assert_eq!(opts.get(&ColumnOption::Length), Some(&255));

        let (dt, opts) = parse_database_type("name", "character varying(40)").unwrap();
        assert_eq!(dt, DataType::String);
        assert_eq!(opts.get(&ColumnOption::Length), Some(&40));

        let (dt, opts) = parse_database_type("price", "DECIMAL(10,2)").unwrap();
        assert_eq!(dt, DataType::Decimal);
        assert_eq!(opts.get(&ColumnOption::Precision), Some(&10));
        assert_eq!(opts.get(&ColumnOption::Scale), Some(&2));

        let (dt, _) = parse_database_type("note", "text").unwrap();
        assert_eq!(dt, DataType::Text);
    }

    #[test]
    fn test_parse_database_type_unknown_is_hard_error() {
        let err = parse_database_type("geom", "GEOGRAPHY(POINT)").unwrap_err();
        match err {
            SyncError::TypeParse { column, type_str } => {
                assert_eq!(column, "geom");
                assert_eq!(type_str, "GEOGRAPHY(POINT)");
            }
            other => panic!("expected TypeParse, got {other:?}"),
        }

        assert!(parse_database_type("id", "INT(10)").is_err());
    }

    #[test]
    fn test_parse_database_type_rejects_non_numeric_args() {
        // Dropping the argument would lose precision/length silently.
        assert!(parse_database_type("price", "DECIMAL(banana)").is_err());
        assert!(parse_database_type("price", "DECIMAL(10,x)").is_err());
        assert!(parse_database_type("name", "VARCHAR(MAX)").is_err());
        assert!(parse_database_type("name", "VARCHAR()").is_err());
    }

    #[test]
    fn test_type_round_trip() {
        let accepted = [
            "INT2", "INT4", "INT8", "FLOAT4", "FLOAT8", "VARCHAR(255)", "VARCHAR(1)", "TEXT",
            "BOOLEAN", "DATE", "TIMESTAMP", "DECIMAL", "DECIMAL(10)", "DECIMAL(10,2)",
        ];
        for type_str in accepted {
            let (dt, opts) = parse_database_type("c", type_str).unwrap();
            let column = Column {
                name: "c".to_string(),
                data_type: dt,
                options: opts.clone(),
            };
            let rendered = column.render_ddl();
            let (dt2, opts2) = parse_database_type("c", &rendered).unwrap();
            assert_eq!(dt, dt2, "round-trip for {type_str} via {rendered}");
            assert_eq!(opts, opts2, "round-trip options for {type_str} via {rendered}");
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let column = Column::new("price", DataType::Decimal)
            .with_option(ColumnOption::Scale, 2)
            .with_option(ColumnOption::Precision, 10);
        assert_eq!(column.render_ddl(), "DECIMAL(10,2)");
        assert_eq!(column.render_ddl(), column.clone().render_ddl());
    }

    #[test]
    fn test_computed_marker_does_not_affect_ddl() {
        let column = Column::new("full_name", DataType::Text).with_option(ColumnOption::Computed, 1);
        assert!(column.is_computed());
        assert_eq!(column.render_ddl(), "TEXT");
    }

    #[test]
    fn test_importable_columns_intersection() {
        let source = Table::new(
            "s",
            "t",
            vec![
                Column::new("id", DataType::Integer).with_option(ColumnOption::Bytes, 8),
                Column::new("only_in_source", DataType::Text),
                Column::new("name", DataType::String).with_option(ColumnOption::Length, 255),
            ],
        );
        let destination = Table::new(
            "s",
            "t",
            vec![
                Column::new("id", DataType::Integer).with_option(ColumnOption::Bytes, 8),
                Column::new("name", DataType::String).with_option(ColumnOption::Length, 100),
                Column::new("only_in_dest", DataType::Text),
            ],
        );

        let both = importable_columns(&destination, &source);
        let names: Vec<_> = both.iter().map(|c| c.name.as_str()).collect();
        // Destination order, one-sided columns dropped.
        assert_eq!(names, vec!["id", "name"]);
    }
}
