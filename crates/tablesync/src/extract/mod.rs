//! Extract configuration: the resolved, validated output of running a
//! table's or endpoint's configuration script.
//!
//! A [`TableExtract`] (or [`Endpoint`]) is built fresh by executing the
//! user script once per run, never mutated afterwards, and discarded at
//! run end. The script surface itself lives in [`script`].

pub mod script;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::classify::ErrorPolicy;
use crate::conn::Row;
use crate::error::{Result, SyncError};
use crate::schema::{parse_database_type, Column, ColumnOption, Table};

use script::{ScriptEngine, ScriptFn};

/// Load strategy governing which source rows are extracted on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadStrategy {
    /// All rows; destination contents are atomically replaced.
    Full,
    /// Rows with primary key greater than the destination watermark.
    Incremental,
    /// Rows modified within a trailing time window, upserted by primary key.
    ModifiedOnly,
}

impl LoadStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Full" => Some(LoadStrategy::Full),
            "Incremental" => Some(LoadStrategy::Incremental),
            "ModifiedOnly" => Some(LoadStrategy::ModifiedOnly),
            _ => None,
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadStrategy::Full => "Full",
            LoadStrategy::Incremental => "Incremental",
            LoadStrategy::ModifiedOnly => "ModifiedOnly",
        };
        f.write_str(name)
    }
}

/// Strategy plus its per-strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOptions {
    pub strategy: LoadStrategy,
    pub primary_key: Option<String>,
    pub modified_at_column: Option<String>,
    pub go_back_hours: Option<i64>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::full()
    }
}

impl LoadOptions {
    /// The default strategy when no configuration is present.
    pub fn full() -> Self {
        Self {
            strategy: LoadStrategy::Full,
            primary_key: None,
            modified_at_column: None,
            go_back_hours: None,
        }
    }

    /// Validate that the argument set matches the strategy, reporting the
    /// offending argument by name.
    pub fn validate(&self) -> Result<()> {
        let require = |field: &Option<String>, name: &str| {
            if field.as_deref().is_none_or(str::is_empty) {
                Err(SyncError::Config(format!(
                    "LoadStrategy(): {} requires `{}`",
                    self.strategy, name
                )))
            } else {
                Ok(())
            }
        };

        match self.strategy {
            LoadStrategy::Full => {}
            LoadStrategy::Incremental => {
                require(&self.primary_key, "primary_key")?;
            }
            LoadStrategy::ModifiedOnly => {
                require(&self.primary_key, "primary_key")?;
                require(&self.modified_at_column, "modified_at_column")?;
                if self.go_back_hours.is_none() {
                    return Err(SyncError::Config(
                        "LoadStrategy(): ModifiedOnly requires `go_back_hours`".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The primary key, for strategies that require one. Call after
    /// [`validate`](Self::validate).
    pub fn primary_key(&self) -> &str {
        self.primary_key.as_deref().unwrap_or_default()
    }
}

/// A script-derived column appended to the extract.
#[derive(Debug, Clone)]
pub struct ComputedColumn {
    pub name: String,
    pub column_type: String,
    pub function: ScriptFn,
}

impl ComputedColumn {
    /// Convert to canonical column metadata, marked as computed.
    pub fn to_column(&self) -> Result<Column> {
        let (data_type, mut options) = parse_database_type(&self.name, &self.column_type)?;
        options.insert(ColumnOption::Computed, 1);
        Ok(Column {
            name: self.name.clone(),
            data_type,
            options,
        })
    }
}

/// Resolved extract configuration for one database table.
#[derive(Debug, Clone, Default)]
pub struct TableExtract {
    pub load: LoadOptions,

    /// Transform chains keyed by column name, applied in declaration order
    /// once per row during staging population.
    pub column_transforms: HashMap<String, Vec<ScriptFn>>,

    /// Computed columns in declaration order.
    pub computed_columns: Vec<ComputedColumn>,

    pub(crate) script: Option<Arc<ScriptEngine>>,
}

impl TableExtract {
    /// The documented fallback when no configuration script matches:
    /// strategy Full, no transforms.
    pub fn default_full() -> Self {
        Self::default()
    }

    pub(crate) fn with_script(mut self, script: Arc<ScriptEngine>) -> Self {
        self.script = Some(script);
        self
    }

    /// Apply this extract's column transforms to one row in place.
    ///
    /// `columns` names the row's cells positionally. Transform functions
    /// are opaque to the engine and chained per column in declaration
    /// order.
    pub fn apply_transforms(&self, columns: &[String], row: &mut Row) -> Result<()> {
        if self.column_transforms.is_empty() {
            return Ok(());
        }
        let script = self.script()?;
        for (index, column) in columns.iter().enumerate() {
            let Some(chain) = self.column_transforms.get(column) else {
                continue;
            };
            for function in chain {
                row[index] = script.call_transform(function, row[index].as_deref())?;
            }
        }
        Ok(())
    }

    /// Evaluate computed columns against one (already transformed) row,
    /// returning the values to append, in declaration order.
    pub fn compute_values(&self, columns: &[String], row: &Row) -> Result<Vec<Option<String>>> {
        if self.computed_columns.is_empty() {
            return Ok(Vec::new());
        }
        let script = self.script()?;
        self.computed_columns
            .iter()
            .map(|computed| script.call_compute(&computed.function, columns, row))
            .collect()
    }

    fn script(&self) -> Result<&ScriptEngine> {
        self.script.as_deref().ok_or_else(|| {
            SyncError::Config("extract configuration holds functions but no script".to_string())
        })
    }
}

/// HTTP request method for endpoint extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Declared response body format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Json,
    Csv,
}

impl ResponseType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "json" => Some(ResponseType::Json),
            "csv" => Some(ResponseType::Csv),
            _ => None,
        }
    }
}

/// Resolved extract configuration for one HTTP API endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub response_type: ResponseType,
    pub paginate: Option<ScriptFn>,
    pub transform: Option<ScriptFn>,

    /// Destination column definitions, in declared order.
    pub table_definition: Vec<(String, String)>,

    pub error_policy: ErrorPolicy,
    pub load: LoadOptions,

    pub(crate) script: Arc<ScriptEngine>,
}

impl Endpoint {
    /// Validate the endpoint after script execution, naming the failing
    /// call in each error.
    pub fn validate(&self) -> Result<()> {
        let lowered = self.url.to_lowercase();
        if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
            return Err(SyncError::Config(format!(
                "Get(): URL must start with http:// or https://, got '{}'",
                self.url
            )));
        }
        if self.table_definition.is_empty() {
            return Err(SyncError::Config(
                "TableDefinition(): endpoint requires a table definition".to_string(),
            ));
        }
        self.load.validate()
    }

    /// Build the destination table from the declared definition.
    pub fn table(&self, source: &str, name: &str) -> Result<Table> {
        let mut columns = Vec::with_capacity(self.table_definition.len());
        for (column_name, type_str) in &self.table_definition {
            let (data_type, options) = parse_database_type(column_name, type_str)?;
            columns.push(Column {
                name: column_name.clone(),
                data_type,
                options,
            });
        }
        Ok(Table::new(source, name, columns))
    }

    /// Column names of the table definition, in declared order.
    pub fn column_names(&self) -> Vec<String> {
        self.table_definition
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_options_validation() {
        assert!(LoadOptions::full().validate().is_ok());

        let incremental = LoadOptions {
            strategy: LoadStrategy::Incremental,
            primary_key: None,
            modified_at_column: None,
            go_back_hours: None,
        };
        let err = incremental.validate().unwrap_err().to_string();
        assert!(err.contains("Incremental requires `primary_key`"), "{err}");

        let modified = LoadOptions {
            strategy: LoadStrategy::ModifiedOnly,
            primary_key: Some("id".to_string()),
            modified_at_column: Some("updated_at".to_string()),
            go_back_hours: None,
        };
        let err = modified.validate().unwrap_err().to_string();
        assert!(err.contains("requires `go_back_hours`"), "{err}");

        let modified = LoadOptions {
            strategy: LoadStrategy::ModifiedOnly,
            primary_key: Some("id".to_string()),
            modified_at_column: Some("updated_at".to_string()),
            go_back_hours: Some(24),
        };
        assert!(modified.validate().is_ok());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(LoadStrategy::from_name("Full"), Some(LoadStrategy::Full));
        assert_eq!(
            LoadStrategy::from_name("ModifiedOnly"),
            Some(LoadStrategy::ModifiedOnly)
        );
        assert_eq!(LoadStrategy::from_name("Partial"), None);
        assert_eq!(LoadStrategy::Incremental.to_string(), "Incremental");
    }

    #[test]
    fn test_default_extract_is_full() {
        let extract = TableExtract::default_full();
        assert_eq!(extract.load.strategy, LoadStrategy::Full);
        assert!(extract.column_transforms.is_empty());
        assert!(extract.computed_columns.is_empty());
    }
}
