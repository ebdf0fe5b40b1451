//! # tablesync
//!
//! Data warehouse synchronization library.
//!
//! Extracts relational tables and paginated HTTP APIs into a destination
//! warehouse through run-scoped staging tables, with support for:
//!
//! - **Load strategies**: Full replace, Incremental append by primary-key
//!   watermark, and ModifiedOnly upsert over a trailing time window
//! - **Per-dialect SQL generation** for MySQL, PostgreSQL, Redshift,
//!   Snowflake and SQLite destinations
//! - **Sandboxed Lua configuration scripts** with per-column transforms
//!   and computed columns
//! - **Classified extraction errors** with per-class retry/fail policy
//! - **Concurrent per-table pipelines** with failure isolation
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tablesync::{PostgresConnection, Registry, TableExtract, TableSync};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> tablesync::Result<()> {
//!     let registry = Registry::load("databases.yaml")?;
//!     let source = PostgresConnection::connect("crm", registry.get("crm")?).await?;
//!     let warehouse = PostgresConnection::connect("dw", registry.get("dw")?).await?;
//!
//!     let sync = TableSync::new(
//!         Arc::new(source),
//!         Arc::new(warehouse),
//!         "widgets",
//!         TableExtract::default_full(),
//!     );
//!     let report = sync.run(&CancellationToken::new()).await?;
//!     println!("Loaded {} rows", report.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod classify;
pub mod config;
pub mod conn;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod schema;

// Re-exports for convenient access
pub use api::ApiExtractor;
pub use classify::{ErrorClass, ErrorPolicy, ExitAction};
pub use config::{Database, Registry};
pub use conn::postgres::PostgresConnection;
pub use conn::{BulkLoader, Connection, Destination, Row};
pub use dialect::{select_dialect, Dialect, Engine};
pub use engine::{EndpointSync, MergeLocks, SyncReport, TableSync};
pub use error::{Result, SyncError};
pub use extract::script::{ScriptEngine, ScriptFn};
pub use extract::{Endpoint, LoadOptions, LoadStrategy, TableExtract};
pub use orchestrator::{EndpointJob, Orchestrator, RunReport, TableJob};
pub use schema::{Column, DataType, Table};
