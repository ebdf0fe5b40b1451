//! Named-connection registry and configuration loading.
//!
//! The registry is an explicit value constructed once at startup and passed
//! by reference into every component that needs a named connection. There
//! is no ambient global map.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dialect::Engine;
use crate::error::{Result, SyncError};

/// One named database connection entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    /// Connection URL, with environment variables expanded at load time.
    pub url: String,

    /// Driver-specific options passed through to the connector.
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Readonly connections refuse to be used as a destination.
    #[serde(default)]
    pub readonly: bool,
}

impl Database {
    /// Resolve the engine from the URL scheme, falling back to MySQL for
    /// unrecognized schemes (same policy as dialect selection).
    pub fn engine(&self) -> Engine {
        Engine::from_url(&self.url).unwrap_or(Engine::MySql)
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionsFile {
    connections: HashMap<String, Database>,
}

/// Read-only registry of named connections, populated once at startup.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    connections: HashMap<String, Database>,
}

impl Registry {
    /// Load the registry from a YAML file with a top-level `connections:`
    /// map. URLs have `$VAR`/`${VAR}` references expanded.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse the registry from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: ConnectionsFile = serde_yaml::from_str(yaml)?;
        let connections = file
            .connections
            .into_iter()
            .map(|(name, mut database)| {
                database.url = expand_env(&database.url);
                (name, database)
            })
            .collect();
        Ok(Self { connections })
    }

    /// Build a registry from already-resolved entries (used by embedders
    /// and tests).
    pub fn from_entries(entries: HashMap<String, Database>) -> Self {
        Self {
            connections: entries,
        }
    }

    /// Look up a named connection.
    pub fn get(&self, name: &str) -> Result<&Database> {
        self.connections.get(name).ok_or_else(|| {
            SyncError::Config(format!("no connection named '{name}' in the registry"))
        })
    }

    /// Registered connection names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Expand `$VAR` and `${VAR}` references from the process environment.
/// Unset variables expand to the empty string.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some((_, c)) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_from_yaml() {
        let registry = Registry::from_yaml(
            r#"
connections:
  warehouse:
    url: postgres://warehouse.internal/analytics
  app:
    url: mysql://app.internal/app
    readonly: true
    options:
      sslmode: require
"#,
        )
        .unwrap();

        assert_eq!(registry.names(), vec!["app", "warehouse"]);
        let app = registry.get("app").unwrap();
        assert!(app.readonly);
        assert_eq!(app.engine(), Engine::MySql);
        assert_eq!(app.options.get("sslmode").map(String::as_str), Some("require"));
        assert_eq!(registry.get("warehouse").unwrap().engine(), Engine::Postgres);
    }

    #[test]
    fn test_registry_load_from_file() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connections:\n  dw:\n    url: postgres://host/dw").unwrap();
        let registry = Registry::load(file.path()).unwrap();
        assert_eq!(registry.names(), vec!["dw"]);
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = Registry::default();
        assert!(matches!(registry.get("nope"), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("TABLESYNC_TEST_HOST", "db.example.com");
        assert_eq!(
            expand_env("postgres://$TABLESYNC_TEST_HOST/app"),
            "postgres://db.example.com/app"
        );
        assert_eq!(
            expand_env("postgres://${TABLESYNC_TEST_HOST}/app"),
            "postgres://db.example.com/app"
        );
        assert_eq!(expand_env("no variables"), "no variables");
        assert_eq!(expand_env("$TABLESYNC_TEST_UNSET/x"), "/x");
        assert_eq!(expand_env("50$"), "50$");
    }

    #[test]
    fn test_registry_expands_url_env() {
        std::env::set_var("TABLESYNC_TEST_DB", "registrydb");
        let registry = Registry::from_yaml(
            "connections:\n  main:\n    url: postgres://host/${TABLESYNC_TEST_DB}\n",
        )
        .unwrap();
        assert_eq!(registry.get("main").unwrap().url, "postgres://host/registrydb");
    }
}
