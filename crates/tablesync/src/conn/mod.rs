//! Connection and bulk-load interfaces.
//!
//! The engine never opens raw sockets itself: sources and destinations are
//! opaque handles behind [`Connection`], and staging-table population goes
//! through [`BulkLoader`]. A reference PostgreSQL implementation lives in
//! [`postgres`]; other engines plug in from outside the crate.

pub mod postgres;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::dialect::Engine;
use crate::error::Result;
use crate::schema::Table;

/// One result row: cells in column order, `None` meaning SQL NULL.
pub type Row = Vec<Option<String>>;

/// Opaque database connection handle.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Registry name of this connection, used in staging/destination
    /// naming and log context.
    fn name(&self) -> &str;

    /// The engine resolved at connection-open time.
    fn engine(&self) -> Engine;

    /// Run a query and collect all rows.
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;

    /// Execute one or more statements, returning the affected-row count.
    async fn exec(&self, sql: &str) -> Result<u64>;

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    /// Names of the tables visible on this connection.
    async fn table_names(&self) -> Result<Vec<String>>;

    /// Introspect a table into canonical schema metadata.
    async fn dump_table_metadata(&self, table: &str) -> Result<Table>;

    /// Escape an identifier per the connection's dialect.
    fn escape_identifier(&self, name: &str) -> String {
        self.engine().dialect().escape_identifier(name)
    }
}

/// Row sink performing an engine-appropriate bulk insert into a table.
///
/// Implementations stream batches from the channel rather than buffering
/// the full result set; a blank/absent source cell always maps to SQL
/// NULL, never to an empty string.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: mpsc::Receiver<Result<Vec<Row>>>,
    ) -> Result<u64>;
}

/// A destination connection: queryable and bulk-loadable.
pub trait Destination: Connection + BulkLoader {}
impl<T: Connection + BulkLoader + ?Sized> Destination for T {}
