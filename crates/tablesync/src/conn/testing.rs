//! Scripted in-memory connection for pipeline tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::conn::{BulkLoader, Connection, Row};
use crate::dialect::Engine;
use crate::error::{Result, SyncError};
use crate::schema::Table;

/// Records every statement and serves canned query results.
#[derive(Default)]
pub struct MockDb {
    pub name: String,
    pub tables: Vec<String>,
    pub metadata: HashMap<String, Table>,
    /// First matching substring wins.
    pub query_results: Vec<(String, Vec<Row>)>,
    /// Statements containing this substring fail; the sentinel `"load"`
    /// fails the bulk-load path instead.
    pub fail_on: Option<String>,
    pub log: Arc<Mutex<Vec<String>>>,
    pub loaded: Arc<Mutex<Vec<(String, Vec<String>, Vec<Row>)>>>,
}

impl MockDb {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    fn check_fail(&self, sql: &str) -> Result<()> {
        if let Some(needle) = &self.fail_on {
            if sql.contains(needle.as_str()) {
                return Err(SyncError::connection(&self.name, format!("boom: {sql}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockDb {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.log.lock().unwrap().push(sql.to_string());
        self.check_fail(sql)?;
        for (needle, rows) in &self.query_results {
            if sql.contains(needle.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn exec(&self, sql: &str) -> Result<u64> {
        self.log.lock().unwrap().push(sql.to_string());
        self.check_fail(sql)?;
        Ok(0)
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
        Ok(self.tables.clone())
    }

    async fn dump_table_metadata(&self, name: &str) -> Result<Table> {
        self.metadata
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::schema(name, "table not found"))
    }
}

#[async_trait]
impl BulkLoader for MockDb {
    async fn load_rows(
        &self,
        staging: &str,
        columns: &[String],
        mut rows: mpsc::Receiver<Result<Vec<Row>>>,
    ) -> Result<u64> {
        let mut all = Vec::new();
        while let Some(batch) = rows.recv().await {
            all.extend(batch?);
        }
        if self.fail_on.as_deref() == Some("load") {
            return Err(SyncError::connection(&self.name, "load failed"));
        }
        let count = all.len() as u64;
        self.loaded
            .lock()
            .unwrap()
            .push((staging.to_string(), columns.to_vec(), all));
        Ok(count)
    }
}
