//! Sandboxed Lua loader for extract configuration scripts.
//!
//! Scripts run once, synchronously, before any strategy logic. The
//! interpreter exposes exactly the builder surface below and nothing else
//! of the host environment (no io, os, require). User functions declared
//! through the builder are stored as opaque registry references and
//! invoked later, once per row or per page.
//!
//! Table scripts:
//!
//! ```lua
//! Table("widgets")
//!     :LoadStrategy(ModifiedOnly, {
//!         primary_key = "id",
//!         modified_at_column = "updated_at",
//!         go_back_hours = 24,
//!     })
//!     :TransformColumn("name", function(value) return string.upper(value) end)
//!     :ComputeColumn("name_length", function(row) return #row.name end, "INT4")
//! ```
//!
//! A `Table("*")` entry acts as a wildcard fallback for tables without
//! their own entry. Endpoint scripts:
//!
//! ```lua
//! Get("https://api.example.com/widgets")
//!     :AddHeader("Accept", "application/json")
//!     :BasicAuth("user", "secret")
//!     :ResponseType("json")
//!     :TableDefinition({ { "id", "INT8" }, { "name", "VARCHAR(255)" } })
//!     :ErrorHandling({ [Http5XXError] = Retry, [NetworkError] = Retry })
//!     :LoadStrategy(Incremental, { primary_key = "id" })
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{
    Function, Lua, LuaOptions, LuaSerdeExt, RegistryKey, StdLib, Table as LuaTable, Value,
};
use tracing::warn;

use crate::classify::{ErrorClass, ErrorPolicy, ExitAction};
use crate::config::expand_env;
use crate::conn::Row;
use crate::error::{Result, SyncError};
use crate::extract::{
    ComputedColumn, Endpoint, LoadOptions, LoadStrategy, Method, ResponseType, TableExtract,
};

/// Opaque reference to a user-supplied script function.
#[derive(Clone)]
pub struct ScriptFn(Arc<RegistryKey>);

impl fmt::Debug for ScriptFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptFn")
    }
}

#[derive(Default)]
struct TableConfig {
    load: LoadOptions,
    transforms: HashMap<String, Vec<ScriptFn>>,
    computed: Vec<ComputedColumn>,
}

#[derive(Default)]
struct EndpointConfig {
    url: Option<String>,
    method: Method,
    headers: Vec<(String, String)>,
    basic_auth: Option<(String, String)>,
    response_type: ResponseType,
    paginate: Option<ScriptFn>,
    transform: Option<ScriptFn>,
    table_definition: Vec<(String, String)>,
    error_policy: ErrorPolicy,
    load: LoadOptions,
}

#[derive(Default)]
struct LoaderState {
    tables: HashMap<String, TableConfig>,
    endpoint: Option<EndpointConfig>,
}

/// One executed configuration script and its interpreter.
///
/// The interpreter is kept alive for the duration of the run because
/// transform, compute and paginate functions live in its registry.
pub struct ScriptEngine {
    lua: Lua,
    state: Arc<Mutex<LoaderState>>,
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ScriptEngine")
    }
}

impl ScriptEngine {
    /// Build a sandboxed interpreter with the builder surface registered.
    fn new() -> Result<Self> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(|e| SyncError::Script(format!("interpreter init: {e}")))?;

        let state = Arc::new(Mutex::new(LoaderState::default()));
        register_globals(&lua, Arc::clone(&state))?;

        Ok(Self { lua, state })
    }

    /// Execute a table configuration script from a string.
    pub fn load_tables_str(source: &str, chunk_name: &str) -> Result<Arc<Self>> {
        let engine = Self::new()?;
        engine.lua.load(source).set_name(chunk_name).exec()?;
        Ok(Arc::new(engine))
    }

    /// Execute a table configuration script from a file.
    pub fn load_tables_file(path: &Path) -> Result<Arc<Self>> {
        let source = std::fs::read_to_string(path)?;
        Self::load_tables_str(&source, &path.display().to_string())
    }

    /// Execute an endpoint configuration script from a string.
    pub fn load_endpoint_str(source: &str, chunk_name: &str) -> Result<Arc<Self>> {
        // Same surface; endpoint scripts simply use the Get/Post entry points.
        Self::load_tables_str(source, chunk_name)
    }

    /// Execute an endpoint configuration script from a file.
    pub fn load_endpoint_file(path: &Path) -> Result<Arc<Self>> {
        let source = std::fs::read_to_string(path)?;
        Self::load_endpoint_str(&source, &path.display().to_string())
    }

    /// Resolve the extract configuration for a table.
    ///
    /// Falls back to the `"*"` wildcard entry, then to the documented
    /// default (strategy Full, no transforms) with a warning.
    pub fn table_extract(self: &Arc<Self>, table: &str) -> Result<TableExtract> {
        let state = self.locked()?;
        let config = state.tables.get(table).or_else(|| state.tables.get("*"));
        let Some(config) = config else {
            warn!(table, "no extract configuration found, defaulting to Full");
            return Ok(TableExtract::default_full());
        };

        config.load.validate()?;
        Ok(TableExtract {
            load: config.load.clone(),
            column_transforms: config.transforms.clone(),
            computed_columns: config.computed.clone(),
            ..TableExtract::default()
        }
        .with_script(Arc::clone(self)))
    }

    /// Resolve the endpoint configured by the executed script.
    pub fn endpoint(self: &Arc<Self>) -> Result<Endpoint> {
        let config = {
            let mut state = self.locked()?;
            state.endpoint.take().ok_or_else(|| {
                SyncError::Config("endpoint script did not call Get() or Post()".to_string())
            })?
        };

        let endpoint = Endpoint {
            url: config.url.unwrap_or_default(),
            method: config.method,
            headers: config.headers,
            basic_auth: config.basic_auth,
            response_type: config.response_type,
            paginate: config.paginate,
            transform: config.transform,
            table_definition: config.table_definition,
            error_policy: config.error_policy,
            load: config.load,
            script: Arc::clone(self),
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Names of all tables the script configured, wildcard included.
    pub fn configured_tables(&self) -> Result<Vec<String>> {
        let state = self.locked()?;
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Apply one column transform function to one cell.
    pub fn call_transform(&self, f: &ScriptFn, cell: Option<&str>) -> Result<Option<String>> {
        let function: Function = self.lua.registry_value(&f.0)?;
        let arg = match cell {
            Some(value) => Value::String(self.lua.create_string(value)?),
            None => Value::Nil,
        };
        let result: Value = function.call(arg)?;
        value_to_cell(&result)
    }

    /// Evaluate a computed-column function against a full row.
    ///
    /// The function receives a table keyed by column name.
    pub fn call_compute(&self, f: &ScriptFn, columns: &[String], row: &Row) -> Result<Option<String>> {
        let function: Function = self.lua.registry_value(&f.0)?;
        let arg = self.lua.create_table()?;
        for (column, cell) in columns.iter().zip(row.iter()) {
            if let Some(value) = cell {
                arg.set(column.as_str(), value.as_str())?;
            }
        }
        let result: Value = function.call(arg)?;
        value_to_cell(&result)
    }

    /// Ask the paginate function for the next page URL.
    ///
    /// Receives the previous URL, the 1-based page number just fetched and
    /// the parsed response body; returns the next URL or nil to stop.
    pub fn call_paginate(
        &self,
        f: &ScriptFn,
        previous_url: &str,
        page: u64,
        body: &serde_json::Value,
    ) -> Result<Option<String>> {
        let function: Function = self.lua.registry_value(&f.0)?;
        let body = self.lua.to_value(body)?;
        let result: Value = function.call((previous_url, page, body))?;
        match &result {
            Value::Nil | Value::Boolean(false) => Ok(None),
            _ => value_to_cell(&result),
        }
    }

    /// Map a parsed response body to rows through the endpoint's
    /// transform function.
    ///
    /// The function returns a sequence of rows; each row is either
    /// positional (array-style) or keyed by column name. Cells land in
    /// `columns` order.
    pub fn call_body_transform(
        &self,
        f: &ScriptFn,
        body: &serde_json::Value,
        columns: &[String],
    ) -> Result<Vec<Row>> {
        let function: Function = self.lua.registry_value(&f.0)?;
        let body = self.lua.to_value(body)?;
        let result: Value = function.call(body)?;

        let Value::Table(items) = result else {
            return Err(SyncError::Script(
                "Transform(): function must return a sequence of rows".to_string(),
            ));
        };

        let mut rows = Vec::new();
        for item in items.sequence_values::<LuaTable>() {
            let item = item?;
            let mut row = Vec::with_capacity(columns.len());
            if item.raw_len() > 0 {
                for index in 1..=columns.len() {
                    let value: Value = item.get(index)?;
                    row.push(value_to_cell(&value)?);
                }
            } else {
                for column in columns {
                    let value: Value = item.get(column.as_str())?;
                    row.push(value_to_cell(&value)?);
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn locked(&self) -> Result<MutexGuard<'_, LoaderState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::Script("configuration state poisoned".to_string()))
    }
}

/// Convert a script return value to a row cell. Nil is SQL NULL.
fn value_to_cell(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Nil => Ok(None),
        Value::Boolean(b) => Ok(Some(b.to_string())),
        Value::Integer(i) => Ok(Some(i.to_string())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => Err(SyncError::Script(format!(
            "script returned unsupported value of type {}",
            other.type_name()
        ))),
    }
}

fn lock_state(state: &Mutex<LoaderState>) -> mlua::Result<MutexGuard<'_, LoaderState>> {
    state
        .lock()
        .map_err(|_| mlua::Error::external("configuration state poisoned"))
}

fn register_globals(lua: &Lua, state: Arc<Mutex<LoaderState>>) -> Result<()> {
    let globals = lua.globals();

    // Strategy names and error-handling constants.
    for strategy in ["Full", "Incremental", "ModifiedOnly"] {
        globals.set(strategy, strategy)?;
    }
    for class in ErrorClass::ALL {
        globals.set(class.to_string(), class.to_string())?;
    }
    globals.set("Fail", ExitAction::Fail.code())?;
    globals.set("Retry", ExitAction::Retry.code())?;

    let table_state = Arc::clone(&state);
    let table_fn = lua.create_function(move |lua, name: String| {
        lock_state(&table_state)?
            .tables
            .entry(name.clone())
            .or_default();
        table_builder(lua, name)
    })?;
    globals.set("Table", table_fn)?;

    let get_state = Arc::clone(&state);
    let get_fn = lua.create_function(move |lua, url: String| {
        start_endpoint(&get_state, url, Method::Get)?;
        endpoint_builder(lua)
    })?;
    globals.set("Get", get_fn)?;

    let post_state = Arc::clone(&state);
    let post_fn = lua.create_function(move |lua, url: String| {
        start_endpoint(&post_state, url, Method::Post)?;
        endpoint_builder(lua)
    })?;
    globals.set("Post", post_fn)?;

    lua.set_app_data(state);
    Ok(())
}

// URLs, headers and basic-auth values carry secrets, so `$VAR`/`${VAR}`
// references expand from the environment at script-load time.
fn start_endpoint(state: &Mutex<LoaderState>, url: String, method: Method) -> mlua::Result<()> {
    let mut state = lock_state(state)?;
    if state.endpoint.is_some() {
        return Err(mlua::Error::external(
            "endpoint already configured; one Get()/Post() call per script",
        ));
    }
    state.endpoint = Some(EndpointConfig {
        url: Some(expand_env(&url)),
        method,
        ..EndpointConfig::default()
    });
    Ok(())
}

fn app_state(lua: &Lua) -> mlua::Result<Arc<Mutex<LoaderState>>> {
    lua.app_data_ref::<Arc<Mutex<LoaderState>>>()
        .map(|state| Arc::clone(&state))
        .ok_or_else(|| mlua::Error::external("loader state not registered"))
}

// Table() registers the entry before handing out the builder, so a missing
// entry here means the builder table was tampered with.
fn with_table<F>(lua: &Lua, builder: &LuaTable, apply: F) -> mlua::Result<()>
where
    F: FnOnce(&mut TableConfig) -> mlua::Result<()>,
{
    let name: String = builder.get("__table")?;
    let state = app_state(lua)?;
    let mut state = lock_state(&state)?;
    let config = state
        .tables
        .get_mut(&name)
        .ok_or_else(|| mlua::Error::external(format!("unknown table '{name}'")))?;
    apply(config)
}

fn with_endpoint<F>(lua: &Lua, call: &str, apply: F) -> mlua::Result<()>
where
    F: FnOnce(&mut EndpointConfig) -> mlua::Result<()>,
{
    let state = app_state(lua)?;
    let mut state = lock_state(&state)?;
    let config = state.endpoint.as_mut().ok_or_else(|| {
        mlua::Error::external(format!("{call}(): call Get() or Post() first"))
    })?;
    apply(config)
}

fn registry_fn(lua: &Lua, function: Function) -> mlua::Result<ScriptFn> {
    Ok(ScriptFn(Arc::new(lua.create_registry_value(function)?)))
}

/// Parse a `LoadStrategy(strategy, { ... })` argument pair.
///
/// Unknown strategies and unknown option keys are load-time errors naming
/// the failing call; strategy/argument-set mismatches surface later from
/// [`LoadOptions::validate`].
fn parse_load_options(strategy: &str, options: Option<&LuaTable>) -> mlua::Result<LoadOptions> {
    let strategy = LoadStrategy::from_name(strategy).ok_or_else(|| {
        mlua::Error::external(format!("LoadStrategy(): unknown strategy '{strategy}'"))
    })?;

    let mut load = LoadOptions {
        strategy,
        ..LoadOptions::full()
    };
    if let Some(options) = options {
        for pair in options.pairs::<String, Value>() {
            let (key, value) = pair?;
            match key.as_str() {
                "primary_key" => load.primary_key = Some(expect_string(&key, &value)?),
                "modified_at_column" => {
                    load.modified_at_column = Some(expect_string(&key, &value)?)
                }
                "go_back_hours" => match value {
                    Value::Integer(hours) => load.go_back_hours = Some(hours),
                    other => {
                        return Err(mlua::Error::external(format!(
                            "LoadStrategy(): `go_back_hours` must be an integer, got {}",
                            other.type_name()
                        )))
                    }
                },
                other => {
                    return Err(mlua::Error::external(format!(
                        "LoadStrategy(): unknown argument `{other}`"
                    )))
                }
            }
        }
    }
    Ok(load)
}

fn expect_string(key: &str, value: &Value) -> mlua::Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(mlua::Error::external(format!(
            "LoadStrategy(): `{key}` must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn table_builder(lua: &Lua, name: String) -> mlua::Result<LuaTable> {
    let builder = lua.create_table()?;
    builder.set("__table", name)?;

    builder.set(
        "LoadStrategy",
        lua.create_function(
            |lua, (this, strategy, options): (LuaTable, String, Option<LuaTable>)| {
                let load = parse_load_options(&strategy, options.as_ref())?;
                with_table(lua, &this, |config| {
                    config.load = load;
                    Ok(())
                })?;
                Ok(this)
            },
        )?,
    )?;

    builder.set(
        "TransformColumn",
        lua.create_function(
            |lua, (this, column, function): (LuaTable, String, Function)| {
                let function = registry_fn(lua, function)?;
                with_table(lua, &this, |config| {
                    config.transforms.entry(column).or_default().push(function);
                    Ok(())
                })?;
                Ok(this)
            },
        )?,
    )?;

    builder.set(
        "ComputeColumn",
        lua.create_function(
            |lua, (this, name, function, column_type): (LuaTable, String, Function, String)| {
                let function = registry_fn(lua, function)?;
                with_table(lua, &this, |config| {
                    config.computed.push(ComputedColumn {
                        name,
                        column_type,
                        function,
                    });
                    Ok(())
                })?;
                Ok(this)
            },
        )?,
    )?;

    Ok(builder)
}

fn endpoint_builder(lua: &Lua) -> mlua::Result<LuaTable> {
    let builder = lua.create_table()?;

    builder.set(
        "AddHeader",
        lua.create_function(|lua, (this, key, value): (LuaTable, String, String)| {
            with_endpoint(lua, "AddHeader", |config| {
                config.headers.push((expand_env(&key), expand_env(&value)));
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "BasicAuth",
        lua.create_function(|lua, (this, user, password): (LuaTable, String, String)| {
            with_endpoint(lua, "BasicAuth", |config| {
                config.basic_auth = Some((expand_env(&user), expand_env(&password)));
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "ResponseType",
        lua.create_function(|lua, (this, kind): (LuaTable, String)| {
            let kind = ResponseType::from_name(&kind).ok_or_else(|| {
                mlua::Error::external(format!("ResponseType(): unknown response type '{kind}'"))
            })?;
            with_endpoint(lua, "ResponseType", |config| {
                config.response_type = kind;
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "Paginate",
        lua.create_function(|lua, (this, function): (LuaTable, Function)| {
            let function = registry_fn(lua, function)?;
            with_endpoint(lua, "Paginate", |config| {
                config.paginate = Some(function);
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "Transform",
        lua.create_function(|lua, (this, function): (LuaTable, Function)| {
            let function = registry_fn(lua, function)?;
            with_endpoint(lua, "Transform", |config| {
                config.transform = Some(function);
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "TableDefinition",
        lua.create_function(|lua, (this, definition): (LuaTable, LuaTable)| {
            let mut columns = Vec::new();
            for entry in definition.sequence_values::<LuaTable>() {
                let entry = entry?;
                let name: String = entry.get(1)?;
                let column_type: String = entry.get(2)?;
                if name.is_empty() || column_type.is_empty() {
                    return Err(mlua::Error::external(
                        "TableDefinition(): each entry must be a {name, type} pair",
                    ));
                }
                columns.push((name, column_type));
            }
            with_endpoint(lua, "TableDefinition", |config| {
                config.table_definition = columns;
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "ErrorHandling",
        lua.create_function(|lua, (this, mapping): (LuaTable, LuaTable)| {
            let mut policy = ErrorPolicy::default();
            for pair in mapping.pairs::<String, i64>() {
                let (class_name, code) = pair?;
                let class = ErrorClass::from_name(&class_name).ok_or_else(|| {
                    mlua::Error::external(format!(
                        "ErrorHandling(): unknown error class '{class_name}'"
                    ))
                })?;
                let action = ExitAction::from_code(code).ok_or_else(|| {
                    mlua::Error::external(format!(
                        "ErrorHandling(): unknown action for '{class_name}', use Fail or Retry"
                    ))
                })?;
                policy.insert(class, action);
            }
            with_endpoint(lua, "ErrorHandling", |config| {
                config.error_policy = policy;
                Ok(())
            })?;
            Ok(this)
        })?,
    )?;

    builder.set(
        "LoadStrategy",
        lua.create_function(
            |lua, (this, strategy, options): (LuaTable, String, Option<LuaTable>)| {
                let load = parse_load_options(&strategy, options.as_ref())?;
                with_endpoint(lua, "LoadStrategy", |config| {
                    config.load = load;
                    Ok(())
                })?;
                Ok(this)
            },
        )?,
    )?;

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(source: &str) -> Arc<ScriptEngine> {
        ScriptEngine::load_tables_str(source, "test.lua").unwrap()
    }

    #[test]
    fn test_table_script_resolves_strategy() {
        let engine = load(
            r#"
            Table("widgets")
                :LoadStrategy(ModifiedOnly, {
                    primary_key = "id",
                    modified_at_column = "updated_at",
                    go_back_hours = 24,
                })
            "#,
        );

        let extract = engine.table_extract("widgets").unwrap();
        assert_eq!(extract.load.strategy, LoadStrategy::ModifiedOnly);
        assert_eq!(extract.load.primary_key.as_deref(), Some("id"));
        assert_eq!(extract.load.go_back_hours, Some(24));
    }

    #[test]
    fn test_missing_table_defaults_to_full() {
        let engine = load(r#"Table("widgets"):LoadStrategy(Full)"#);
        let extract = engine.table_extract("orders").unwrap();
        assert_eq!(extract.load.strategy, LoadStrategy::Full);
        assert!(extract.column_transforms.is_empty());
    }

    #[test]
    fn test_wildcard_fallback() {
        let engine = load(
            r#"
            Table("*"):LoadStrategy(Incremental, { primary_key = "id" })
            Table("widgets"):LoadStrategy(Full)
            "#,
        );

        let widgets = engine.table_extract("widgets").unwrap();
        assert_eq!(widgets.load.strategy, LoadStrategy::Full);

        let other = engine.table_extract("orders").unwrap();
        assert_eq!(other.load.strategy, LoadStrategy::Incremental);
    }

    #[test]
    fn test_transform_chain_applies_in_order() {
        let engine = load(
            r#"
            Table("widgets")
                :TransformColumn("name", function(v) return string.upper(v) end)
                :TransformColumn("name", function(v) return v .. "!" end)
            "#,
        );

        let extract = engine.table_extract("widgets").unwrap();
        let columns = vec!["id".to_string(), "name".to_string()];
        let mut row = vec![Some("1".to_string()), Some("bolt".to_string())];
        extract.apply_transforms(&columns, &mut row).unwrap();
        assert_eq!(row[1].as_deref(), Some("BOLT!"));
        assert_eq!(row[0].as_deref(), Some("1"));
    }

    #[test]
    fn test_transform_handles_null_cells() {
        let engine = load(
            r#"
            Table("widgets")
                :TransformColumn("name", function(v)
                    if v == nil then return "unknown" end
                    return v
                end)
            "#,
        );

        let extract = engine.table_extract("widgets").unwrap();
        let columns = vec!["name".to_string()];
        let mut row = vec![None];
        extract.apply_transforms(&columns, &mut row).unwrap();
        assert_eq!(row[0].as_deref(), Some("unknown"));
    }

    #[test]
    fn test_computed_column() {
        let engine = load(
            r#"
            Table("widgets")
                :ComputeColumn("name_length", function(row) return #row.name end, "INT4")
            "#,
        );

        let extract = engine.table_extract("widgets").unwrap();
        assert_eq!(extract.computed_columns.len(), 1);
        assert_eq!(extract.computed_columns[0].name, "name_length");

        let columns = vec!["id".to_string(), "name".to_string()];
        let row = vec![Some("1".to_string()), Some("bolt".to_string())];
        let values = extract.compute_values(&columns, &row).unwrap();
        assert_eq!(values, vec![Some("4".to_string())]);
    }

    #[test]
    fn test_invalid_strategy_arguments_name_the_argument() {
        let engine = load(
            r#"
            Table("widgets"):LoadStrategy(Incremental)
            "#,
        );
        let err = engine.table_extract("widgets").unwrap_err().to_string();
        assert!(err.contains("Incremental requires `primary_key`"), "{err}");
    }

    #[test]
    fn test_unknown_strategy_argument_is_load_time_error() {
        let err = ScriptEngine::load_tables_str(
            r#"Table("widgets"):LoadStrategy(Full, { primray_key = "id" })"#,
            "test.lua",
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("unknown argument `primray_key`"), "{err}");
    }

    #[test]
    fn test_sandbox_has_no_os_or_io() {
        let err = ScriptEngine::load_tables_str(r#"os.execute("true")"#, "test.lua");
        assert!(err.is_err());
        let err = ScriptEngine::load_tables_str(r#"io.open("/etc/passwd")"#, "test.lua");
        assert!(err.is_err());
    }

    #[test]
    fn test_endpoint_script() {
        let engine = ScriptEngine::load_endpoint_str(
            r#"
            Get("https://api.example.com/widgets")
                :AddHeader("Accept", "application/json")
                :BasicAuth("user", "secret")
                :ResponseType("json")
                :TableDefinition({ { "id", "INT8" }, { "name", "VARCHAR(255)" } })
                :ErrorHandling({ [Http5XXError] = Retry })
                :LoadStrategy(Incremental, { primary_key = "id" })
            "#,
            "endpoint.lua",
        )
        .unwrap();

        let endpoint = engine.endpoint().unwrap();
        assert_eq!(endpoint.url, "https://api.example.com/widgets");
        assert_eq!(endpoint.method, Method::Get);
        assert_eq!(endpoint.response_type, ResponseType::Json);
        assert_eq!(endpoint.headers.len(), 1);
        assert_eq!(
            endpoint.basic_auth,
            Some(("user".to_string(), "secret".to_string()))
        );
        assert_eq!(
            endpoint.column_names(),
            vec!["id".to_string(), "name".to_string()]
        );
        assert_eq!(
            endpoint.error_policy.action_for(ErrorClass::Http5XXError),
            ExitAction::Retry
        );
        assert_eq!(
            endpoint.error_policy.action_for(ErrorClass::Http4XXError),
            ExitAction::Fail
        );
    }

    #[test]
    fn test_endpoint_expands_environment_references() {
        std::env::set_var("TABLESYNC_TEST_API_HOST", "api.example.com");
        std::env::set_var("TABLESYNC_TEST_API_KEY", "k123");
        std::env::set_var("TABLESYNC_TEST_API_USER", "svc");
        std::env::set_var("TABLESYNC_TEST_API_PASSWORD", "hunter2");

        let engine = ScriptEngine::load_endpoint_str(
            r#"
            Get("https://$TABLESYNC_TEST_API_HOST/widgets")
                :AddHeader("x-api-key", "${TABLESYNC_TEST_API_KEY}")
                :BasicAuth("$TABLESYNC_TEST_API_USER", "$TABLESYNC_TEST_API_PASSWORD")
                :TableDefinition({ { "id", "INT8" } })
            "#,
            "endpoint.lua",
        )
        .unwrap();

        let endpoint = engine.endpoint().unwrap();
        assert_eq!(endpoint.url, "https://api.example.com/widgets");
        assert_eq!(
            endpoint.headers,
            vec![("x-api-key".to_string(), "k123".to_string())]
        );
        assert_eq!(
            endpoint.basic_auth,
            Some(("svc".to_string(), "hunter2".to_string()))
        );
    }

    #[test]
    fn test_endpoint_requires_table_definition() {
        let engine = ScriptEngine::load_endpoint_str(
            r#"Get("https://api.example.com/widgets")"#,
            "endpoint.lua",
        )
        .unwrap();
        let err = engine.endpoint().unwrap_err().to_string();
        assert!(err.contains("TableDefinition()"), "{err}");
    }

    #[test]
    fn test_endpoint_rejects_non_http_url() {
        let engine = ScriptEngine::load_endpoint_str(
            r#"
            Get("ftp://api.example.com/widgets")
                :TableDefinition({ { "id", "INT8" } })
            "#,
            "endpoint.lua",
        )
        .unwrap();
        let err = engine.endpoint().unwrap_err().to_string();
        assert!(err.contains("http://"), "{err}");
    }

    #[test]
    fn test_paginate_callback() {
        let engine = ScriptEngine::load_endpoint_str(
            r#"
            Get("https://api.example.com/widgets?page=1")
                :TableDefinition({ { "id", "INT8" } })
                :Paginate(function(url, page, body)
                    if body.next_page == nil then return nil end
                    return "https://api.example.com/widgets?page=" .. body.next_page
                end)
            "#,
            "endpoint.lua",
        )
        .unwrap();
        let endpoint = engine.endpoint().unwrap();
        let paginate = endpoint.paginate.as_ref().unwrap();

        let body = serde_json::json!({ "next_page": 2 });
        let next = engine
            .call_paginate(paginate, &endpoint.url, 1, &body)
            .unwrap();
        assert_eq!(
            next.as_deref(),
            Some("https://api.example.com/widgets?page=2")
        );

        let body = serde_json::json!({ "items": [] });
        let next = engine
            .call_paginate(paginate, &endpoint.url, 2, &body)
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_body_transform_keyed_rows() {
        let engine = ScriptEngine::load_endpoint_str(
            r#"
            Get("https://api.example.com/widgets")
                :TableDefinition({ { "id", "INT8" }, { "name", "VARCHAR(255)" } })
                :Transform(function(body)
                    local rows = {}
                    for i, item in ipairs(body.items) do
                        rows[i] = { id = item.id, name = item.label }
                    end
                    return rows
                end)
            "#,
            "endpoint.lua",
        )
        .unwrap();
        let endpoint = engine.endpoint().unwrap();
        let transform = endpoint.transform.as_ref().unwrap();

        let body = serde_json::json!({
            "items": [
                { "id": 1, "label": "bolt" },
                { "id": 2, "label": "nut" },
            ]
        });
        let rows = engine
            .call_body_transform(transform, &body, &endpoint.column_names())
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("bolt".to_string())],
                vec![Some("2".to_string()), Some("nut".to_string())],
            ]
        );
    }
}
