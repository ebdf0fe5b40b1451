//! Reference PostgreSQL connection.
//!
//! Uses the simple-query (text) protocol for reads and introspection so
//! every cell arrives as text regardless of column type, and the COPY
//! protocol fast path for staging-table population.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::config::Database;
use crate::conn::{BulkLoader, Connection, Row};
use crate::dialect::Engine;
use crate::error::{Result, SyncError};
use crate::schema::{parse_database_type, Column, Table};

/// PostgreSQL-backed [`Connection`] and [`BulkLoader`].
pub struct PostgresConnection {
    name: String,
    client: tokio_postgres::Client,
}

impl PostgresConnection {
    /// Connect to a registry entry. The URL, with the entry's options
    /// appended as query parameters, is passed through to tokio-postgres;
    /// TLS endpoints need a connector supplied by the embedder.
    pub async fn connect(name: impl Into<String>, database: &Database) -> Result<Self> {
        let name = name.into();
        let url = url_with_options(&database.url, &database.options);
        let (client, connection) = tokio_postgres::connect(&url, NoTls)
            .await
            .map_err(|e| SyncError::connection(&name, e.to_string()))?;

        let conn_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(database = %conn_name, "connection task ended: {e}");
            }
        });

        Ok(Self { name, client })
    }

    fn wrap(&self, e: tokio_postgres::Error) -> SyncError {
        SyncError::connection(&self.name, e.to_string())
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| self.wrap(e))?;

        let mut rows = Vec::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let cells = (0..row.len())
                    .map(|i| row.get(i).map(str::to_string))
                    .collect();
                rows.push(cells);
            }
        }
        Ok(rows)
    }

    async fn exec(&self, sql: &str) -> Result<u64> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(|e| self.wrap(e))?;

        let affected = messages
            .iter()
            .map(|m| match m {
                SimpleQueryMessage::CommandComplete(n) => *n,
                _ => 0,
            })
            .sum();
        Ok(affected)
    }

    async fn begin(&self) -> Result<()> {
        self.exec("BEGIN").await.map(|_| ())
    }

    async fn commit(&self) -> Result<()> {
        self.exec("COMMIT").await.map(|_| ())
    }

    async fn rollback(&self) -> Result<()> {
        self.exec("ROLLBACK").await.map(|_| ())
    }

    async fn table_names(&self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = current_schema() ORDER BY table_name",
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }

    async fn dump_table_metadata(&self, table: &str) -> Result<Table> {
        let sql = format!(
            "SELECT column_name, data_type, character_maximum_length, \
                    numeric_precision, numeric_scale \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = '{}' \
             ORDER BY ordinal_position",
            table.replace('\'', "''")
        );
        let rows = self.query(&sql).await?;
        if rows.is_empty() {
            return Err(SyncError::schema(table, "table not found during introspection"));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let column_name = row
                .first()
                .cloned()
                .flatten()
                .ok_or_else(|| SyncError::schema(table, "introspection returned a nameless column"))?;
            let data_type = row.get(1).cloned().flatten().unwrap_or_default();
            let type_str = render_native_type(
                &data_type,
                cell_i64(&row, 2),
                cell_i64(&row, 3),
                cell_i64(&row, 4),
            );
            let (canonical, options) = parse_database_type(&column_name, &type_str)?;
            columns.push(Column {
                name: column_name,
                data_type: canonical,
                options,
            });
        }

        debug!(table, columns = columns.len(), "introspected table metadata");
        Ok(Table::new(self.name.clone(), table.to_string(), columns))
    }
}

fn cell_i64(row: &Row, index: usize) -> Option<i64> {
    row.get(index)?.as_deref()?.parse().ok()
}

/// Append registry options to the connection URL as query parameters,
/// sorted by key so the result is deterministic.
fn url_with_options(url: &str, options: &std::collections::HashMap<String, String>) -> String {
    if options.is_empty() {
        return url.to_string();
    }
    let mut keys: Vec<&String> = options.keys().collect();
    keys.sort();

    let mut out = url.to_string();
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for key in keys {
        out.push(separator);
        out.push_str(key);
        out.push('=');
        out.push_str(&options[key]);
        separator = '&';
    }
    out
}

/// Reassemble an information_schema row into a parseable type string.
fn render_native_type(
    data_type: &str,
    char_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
) -> String {
    match data_type {
        "character varying" | "character" => match char_length {
            Some(n) => format!("{data_type}({n})"),
            None => "text".to_string(),
        },
        "numeric" => match (precision, scale) {
            (Some(p), Some(s)) => format!("numeric({p},{s})"),
            (Some(p), None) => format!("numeric({p})"),
            _ => "numeric".to_string(),
        },
        other => other.to_string(),
    }
}

#[async_trait]
impl BulkLoader for PostgresConnection {
    async fn load_rows(
        &self,
        table: &str,
        columns: &[String],
        mut rows: mpsc::Receiver<Result<Vec<Row>>>,
    ) -> Result<u64> {
        let dialect = self.engine().dialect();
        let column_list = columns
            .iter()
            .map(|c| dialect.escape_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let copy_stmt = format!(
            "COPY {} ({}) FROM STDIN",
            dialect.escape_identifier(table),
            column_list
        );

        let sink = self
            .client
            .copy_in::<_, bytes::Bytes>(&copy_stmt)
            .await
            .map_err(|e| self.wrap(e))?;
        futures::pin_mut!(sink);

        let mut buf = BytesMut::with_capacity(1024 * 1024);
        while let Some(batch) = rows.recv().await {
            let batch = batch?;
            for row in batch {
                for (i, cell) in row.iter().enumerate() {
                    if i > 0 {
                        buf.put_u8(b'\t');
                    }
                    buf.extend_from_slice(copy_text(cell.as_deref()).as_bytes());
                }
                buf.put_u8(b'\n');
            }
            if !buf.is_empty() {
                sink.send(buf.split().freeze())
                    .await
                    .map_err(|e| self.wrap(e))?;
            }
        }

        let copied = sink.finish().await.map_err(|e| self.wrap(e))?;
        Ok(copied)
    }
}

/// Encode a cell for text-format COPY. A blank/absent cell is SQL NULL.
fn copy_text(cell: Option<&str>) -> String {
    match cell {
        None | Some("") => "\\N".to_string(),
        Some(value) => value
            .replace('\\', "\\\\")
            .replace('\t', "\\t")
            .replace('\n', "\\n")
            .replace('\r', "\\r"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_text_null_handling() {
        assert_eq!(copy_text(None), "\\N");
        // Blank cells map to NULL, never to an empty string.
        assert_eq!(copy_text(Some("")), "\\N");
        assert_eq!(copy_text(Some("plain")), "plain");
    }

    #[test]
    fn test_copy_text_escaping() {
        assert_eq!(copy_text(Some("a\tb")), "a\\tb");
        assert_eq!(copy_text(Some("a\nb")), "a\\nb");
        assert_eq!(copy_text(Some("a\\b")), "a\\\\b");
    }

    #[test]
    fn test_url_with_options() {
        let mut options = std::collections::HashMap::new();
        assert_eq!(
            url_with_options("postgres://host/db", &options),
            "postgres://host/db"
        );

        options.insert("sslmode".to_string(), "require".to_string());
        options.insert("connect_timeout".to_string(), "10".to_string());
        assert_eq!(
            url_with_options("postgres://host/db", &options),
            "postgres://host/db?connect_timeout=10&sslmode=require"
        );
        assert_eq!(
            url_with_options("postgres://host/db?application_name=sync", &options),
            "postgres://host/db?application_name=sync&connect_timeout=10&sslmode=require"
        );
    }

    #[test]
    fn test_render_native_type() {
        assert_eq!(render_native_type("integer", None, Some(32), Some(0)), "integer");
        assert_eq!(
            render_native_type("character varying", Some(255), None, None),
            "character varying(255)"
        );
        assert_eq!(render_native_type("numeric", None, Some(10), Some(2)), "numeric(10,2)");
        assert_eq!(render_native_type("character varying", None, None, None), "text");
    }
}
