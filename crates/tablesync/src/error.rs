//! Error types for the synchronization library.

use thiserror::Error;

use crate::classify::ErrorClass;

/// Main error type for synchronization operations.
///
/// The variants follow the failure taxonomy of the engine: configuration
/// problems are reported before any I/O, per-table failures are isolated
/// by the orchestrator, and merge failures are always fatal for the
/// affected table.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed extract script or missing required field.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cannot reach the source or destination database.
    #[error("Connection error for '{database}': {message}")]
    Connection { database: String, message: String },

    /// Incompatible or unexpected schema metadata.
    #[error("Schema error for table {table}: {message}")]
    Schema { table: String, message: String },

    /// A dialect-native type string could not be parsed into canonical form.
    ///
    /// Unknown types are a hard error so destination DDL is never wrong.
    #[error("Cannot parse database type for column '{column}': '{type_str}'")]
    TypeParse { column: String, type_str: String },

    /// Classified extraction failure (network, HTTP status, body parse).
    /// Carries the exit code resolved from the endpoint's error policy.
    #[error("Extraction error ({class}): {message}")]
    Extraction {
        class: ErrorClass,
        message: String,
        exit_code: i32,
    },

    /// Transaction failure during the merge step. Always fatal for the
    /// table's run; the staging table is cleaned up regardless.
    #[error("Merge failed for table {table}: {message}")]
    Merge { table: String, message: String },

    /// Extract script raised or was rejected by the interpreter.
    #[error("Script error: {0}")]
    Script(String),

    /// IO error (config files, table definition files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was cancelled (timeout or operator abort).
    #[error("Synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    /// Create a Connection error with the registry name of the database.
    pub fn connection(database: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Connection {
            database: database.into(),
            message: message.into(),
        }
    }

    /// Create a Schema error for a specific table.
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a classified Extraction error with its configured exit code.
    pub fn extraction(class: ErrorClass, message: impl Into<String>, exit_code: i32) -> Self {
        SyncError::Extraction {
            class,
            message: message.into(),
            exit_code,
        }
    }

    /// Create a Merge error for a specific table.
    pub fn merge(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Merge {
            table: table.into(),
            message: message.into(),
        }
    }

    /// The process exit code this error maps to when it is fatal.
    ///
    /// Extraction errors resolve through the endpoint's error-handling
    /// policy before reaching this; everything else uses a generic
    /// non-zero code per variant so schedulers can distinguish outcomes.
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_) | SyncError::Script(_) => 64,
            SyncError::Connection { .. } => 65,
            SyncError::Schema { .. } | SyncError::TypeParse { .. } => 66,
            SyncError::Extraction { exit_code, .. } => *exit_code,
            SyncError::Merge { .. } => 67,
            SyncError::Cancelled => 130,
            _ => 1,
        }
    }
}

impl From<mlua::Error> for SyncError {
    fn from(err: mlua::Error) -> Self {
        SyncError::Script(err.to_string())
    }
}

/// Result type alias for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
