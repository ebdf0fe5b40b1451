//! Run orchestration across tables and endpoints.
//!
//! Jobs run concurrently; each failure is isolated to its own job and
//! collected into the run report. The process exit code reflects the
//! worst outcome across the run.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::ApiExtractor;
use crate::conn::{Connection, Destination};
use crate::engine::{EndpointSync, MergeLocks, SyncReport, TableSync};
use crate::error::{Result, SyncError};
use crate::extract::{Endpoint, TableExtract};

/// One table synchronization to run.
pub struct TableJob {
    pub source: Arc<dyn Connection>,
    pub destination: Arc<dyn Destination>,
    pub table: String,
    pub extract: TableExtract,
}

/// One endpoint synchronization to run.
pub struct EndpointJob {
    pub destination: Arc<dyn Destination>,
    pub namespace: String,
    pub name: String,
    pub endpoint: Endpoint,
}

/// Aggregated outcome of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<SyncReport>,
    pub failed: Vec<(String, SyncError)>,
}

impl RunReport {
    /// Process exit code: 0 on full success, otherwise the highest code
    /// among the failures so schedulers see the worst outcome.
    pub fn exit_code(&self) -> i32 {
        self.failed
            .iter()
            .map(|(_, e)| e.exit_code())
            .max()
            .unwrap_or(0)
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs a batch of sync jobs with shared merge locks.
#[derive(Default)]
pub struct Orchestrator {
    locks: MergeLocks,
    table_jobs: Vec<TableJob>,
    endpoint_jobs: Vec<EndpointJob>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, job: TableJob) -> &mut Self {
        self.table_jobs.push(job);
        self
    }

    pub fn add_endpoint(&mut self, job: EndpointJob) -> &mut Self {
        self.endpoint_jobs.push(job);
        self
    }

    /// Run every job to completion. One job's failure never prevents the
    /// others from finishing.
    pub async fn run(self, cancel: &CancellationToken) -> RunReport {
        let mut tasks: JoinSet<(String, Result<SyncReport>)> = JoinSet::new();

        for job in self.table_jobs {
            let sync = TableSync::new(job.source, job.destination, &job.table, job.extract)
                .with_locks(self.locks.clone());
            let cancel = cancel.clone();
            let label = job.table;
            tasks.spawn(async move {
                let result = sync.run(&cancel).await;
                (label, result)
            });
        }

        for job in self.endpoint_jobs {
            let label = job.name.clone();
            let cancel = cancel.clone();
            let result = ApiExtractor::new(job.endpoint);
            match result {
                Ok(api) => {
                    let sync = EndpointSync::new(api, job.destination, job.namespace, job.name)
                        .with_locks(self.locks.clone());
                    tasks.spawn(async move {
                        let result = sync.run(&cancel).await;
                        (label, result)
                    });
                }
                Err(e) => {
                    tasks.spawn(async move { (label, Err(e)) });
                }
            }
        }

        let mut report = RunReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (label, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("sync task panicked: {e}");
                    report
                        .failed
                        .push(("unknown".to_string(), SyncError::Script(e.to_string())));
                    continue;
                }
            };
            match result {
                Ok(sync_report) => {
                    info!(
                        job = %label,
                        rows = sync_report.rows_loaded,
                        "sync succeeded"
                    );
                    report.succeeded.push(sync_report);
                }
                Err(e) => {
                    error!(job = %label, "sync failed: {e}");
                    report.failed.push((label, e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorClass;
    use crate::conn::testing::MockDb;
    use crate::schema::{parse_database_type, Column, Table};

    fn table(source: &str, name: &str, columns: &[(&str, &str)]) -> Table {
        let columns = columns
            .iter()
            .map(|(column_name, type_str)| {
                let (data_type, options) = parse_database_type(column_name, type_str).unwrap();
                Column {
                    name: column_name.to_string(),
                    data_type,
                    options,
                }
            })
            .collect();
        Table::new(source, name, columns)
    }

    fn source_with(tables: &[&str]) -> MockDb {
        let mut db = MockDb::named("src");
        for name in tables {
            db.metadata
                .insert(name.to_string(), table("src", name, &[("id", "INT8")]));
        }
        db.query_results.push((
            "SELECT".to_string(),
            vec![vec![Some("1".to_string())]],
        ));
        db
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_table() {
        let source: Arc<dyn Connection> = Arc::new(source_with(&["widgets", "orders"]));

        let good: Arc<dyn Destination> = Arc::new(MockDb::named("dw"));
        let mut broken = MockDb::named("dw");
        broken.fail_on = Some("DELETE FROM".to_string());
        broken.tables.push("src_orders".to_string());
        broken.metadata.insert(
            "src_orders".to_string(),
            table("dw", "src_orders", &[("id", "INT8")]),
        );
        let broken: Arc<dyn Destination> = Arc::new(broken);

        let mut orchestrator = Orchestrator::new();
        orchestrator.add_table(TableJob {
            source: Arc::clone(&source),
            destination: good,
            table: "widgets".to_string(),
            extract: TableExtract::default_full(),
        });
        orchestrator.add_table(TableJob {
            source,
            destination: broken,
            table: "orders".to_string(),
            extract: TableExtract::default_full(),
        });

        let report = orchestrator.run(&CancellationToken::new()).await;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].table, "widgets");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "orders");
        assert!(matches!(report.failed[0].1, SyncError::Merge { .. }));
        assert_eq!(report.exit_code(), 67);
    }

    #[tokio::test]
    async fn test_empty_run_succeeds() {
        let report = Orchestrator::new().run(&CancellationToken::new()).await;
        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_exit_code_is_worst_outcome() {
        let mut report = RunReport::default();
        report.failed.push((
            "a".to_string(),
            SyncError::extraction(ErrorClass::Http5XXError, "gone", 2),
        ));
        report
            .failed
            .push(("b".to_string(), SyncError::merge("t", "deadlock")));
        report
            .failed
            .push(("c".to_string(), SyncError::Config("bad".to_string())));
        assert_eq!(report.exit_code(), 67);
    }
}
