//! Per-table synchronization pipeline.
//!
//! Each table or endpoint runs the same sequence: plan, create a
//! run-scoped staging table, populate it with extracted rows, merge it
//! into the destination inside a single transaction, then drop it. The
//! staging drop is unconditional; no failure path leaves a staging table
//! behind. Only the merge transaction takes the per-destination-table
//! lock, so concurrent syncs of different tables against one destination
//! proceed freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ApiExtractor;
use crate::conn::{Connection, Destination, Row};
use crate::error::{Result, SyncError};
use crate::extract::{LoadStrategy, TableExtract};
use crate::schema::{importable_columns, Column, Table};

const BATCH_SIZE: usize = 1000;

/// Per-destination-table merge locks.
///
/// Two concurrent syncs of the same destination table must not interleave
/// their merge transactions; everything before the merge runs unlocked.
#[derive(Clone, Default)]
pub struct MergeLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, table: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(table.to_string()).or_default().clone()
    }
}

/// Outcome of one successful table or endpoint sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub table: String,
    pub destination_table: String,
    pub strategy: LoadStrategy,
    pub rows_loaded: u64,
}

struct Plan {
    dest_table: Table,
    dest_name: String,
    staging: String,
    /// Columns extracted from the source, in destination order.
    columns: Vec<String>,
    /// Staging load list: extracted columns plus computed columns.
    all_columns: Vec<String>,
}

/// Synchronizes one database table into the destination.
pub struct TableSync {
    source: Arc<dyn Connection>,
    destination: Arc<dyn Destination>,
    table: String,
    extract: TableExtract,
    locks: MergeLocks,
}

impl TableSync {
    pub fn new(
        source: Arc<dyn Connection>,
        destination: Arc<dyn Destination>,
        table: impl Into<String>,
        extract: TableExtract,
    ) -> Self {
        Self {
            source,
            destination,
            table: table.into(),
            extract,
            locks: MergeLocks::new(),
        }
    }

    /// Share merge locks with other pipelines targeting the same
    /// destination.
    pub fn with_locks(mut self, locks: MergeLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Run the full pipeline. The staging table is dropped on every path
    /// once planning has named it.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        self.extract.load.validate()?;
        let plan = self.plan().await?;
        info!(
            table = %self.table,
            destination = %plan.dest_name,
            staging = %plan.staging,
            strategy = %self.extract.load.strategy,
            "starting table sync"
        );

        let result = self.execute(&plan, cancel).await;
        drop_staging(self.destination.as_ref(), &plan.staging).await;

        let rows_loaded = result?;
        info!(table = %self.table, rows = rows_loaded, "table sync complete");
        Ok(SyncReport {
            table: self.table.clone(),
            destination_table: plan.dest_name,
            strategy: self.extract.load.strategy,
            rows_loaded,
        })
    }

    async fn plan(&self) -> Result<Plan> {
        let source_table = self.source.dump_table_metadata(&self.table).await?;
        let mut table = source_table.clone();
        table.source = self.source.name().to_string();

        let mut computed = Vec::with_capacity(self.extract.computed_columns.len());
        for column in &self.extract.computed_columns {
            computed.push(column.to_column()?);
        }

        let dest_name = table.destination_name();
        let dest_table = ensure_destination(
            self.destination.as_ref(),
            &table,
            &dest_name,
            &computed,
        )
        .await?;

        let columns: Vec<String> = importable_columns(&dest_table, &table)
            .into_iter()
            .filter(|c| !c.is_computed())
            .map(|c| c.name)
            .collect();
        if columns.is_empty() {
            return Err(SyncError::schema(
                &self.table,
                "no common columns between source and destination",
            ));
        }

        let mut all_columns = columns.clone();
        all_columns.extend(self.extract.computed_columns.iter().map(|c| c.name.clone()));

        Ok(Plan {
            staging: staging_name(&dest_name),
            dest_table,
            dest_name,
            columns,
            all_columns,
        })
    }

    async fn execute(&self, plan: &Plan, cancel: &CancellationToken) -> Result<u64> {
        let dialect = self.destination.engine().dialect();
        self.destination
            .exec(&dialect.render_create_staging(&plan.dest_name, &plan.staging)?)
            .await?;

        let rows_loaded = self.populate(plan, cancel).await?;
        merge(
            self.destination.as_ref(),
            &self.locks,
            plan,
            &self.extract.load.strategy,
            self.extract.load.primary_key(),
        )
        .await?;
        Ok(rows_loaded)
    }

    async fn populate(&self, plan: &Plan, cancel: &CancellationToken) -> Result<u64> {
        let sql = self.extraction_sql(plan).await?;
        debug!(table = %self.table, sql = %sql, "extracting source rows");
        let rows = self.source.query(&sql).await?;

        let (tx, rx) = mpsc::channel(8);
        let loader = self
            .destination
            .load_rows(&plan.staging, &plan.all_columns, rx);
        let feeder = async move {
            for chunk in rows.chunks(BATCH_SIZE) {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(SyncError::Cancelled)).await;
                    return;
                }
                let mut batch = Vec::with_capacity(chunk.len());
                for row in chunk {
                    match self.prepare_row(plan, row.clone()) {
                        Ok(row) => batch.push(row),
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }
        };

        let (loaded, ()) = tokio::join!(loader, feeder);
        loaded
    }

    /// Apply transforms, then append computed cells.
    fn prepare_row(&self, plan: &Plan, mut row: Row) -> Result<Row> {
        if row.len() != plan.columns.len() {
            return Err(SyncError::schema(
                &self.table,
                format!(
                    "source returned {} cells for {} columns",
                    row.len(),
                    plan.columns.len()
                ),
            ));
        }
        self.extract.apply_transforms(&plan.columns, &mut row)?;
        let computed = self.extract.compute_values(&plan.columns, &row)?;
        row.extend(computed);
        Ok(row)
    }

    /// Build the source extraction query for the effective strategy.
    async fn extraction_sql(&self, plan: &Plan) -> Result<String> {
        let dialect = self.source.engine().dialect();
        let column_list = plan
            .columns
            .iter()
            .map(|c| dialect.escape_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM {}",
            column_list,
            dialect.escape_identifier(&self.table)
        );

        match self.extract.load.strategy {
            LoadStrategy::Full => {}
            LoadStrategy::Incremental => {
                let pk = self.extract.load.primary_key();
                if let Some(watermark) = self.watermark(plan, pk).await? {
                    sql.push_str(&format!(
                        " WHERE {} > {}",
                        dialect.escape_identifier(pk),
                        sql_literal(&watermark)
                    ));
                }
            }
            LoadStrategy::ModifiedOnly => {
                let hours = self.extract.load.go_back_hours.unwrap_or_default();
                let cutoff = Utc::now() - chrono::Duration::hours(hours);
                let column = self
                    .extract
                    .load
                    .modified_at_column
                    .as_deref()
                    .unwrap_or_default();
                sql.push_str(&format!(
                    " WHERE {} >= '{}'",
                    dialect.escape_identifier(column),
                    cutoff.format("%Y-%m-%d %H:%M:%S")
                ));
            }
        }
        Ok(sql)
    }

    /// Highest destination primary key, the incremental watermark. A NULL
    /// result (empty destination) means a full extract.
    async fn watermark(&self, plan: &Plan, primary_key: &str) -> Result<Option<String>> {
        let dialect = self.destination.engine().dialect();
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            dialect.escape_identifier(primary_key),
            dialect.escape_identifier(&plan.dest_name)
        );
        let rows = self.destination.query(&sql).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .flatten())
    }
}

/// Synchronizes one HTTP endpoint into the destination.
pub struct EndpointSync {
    api: ApiExtractor,
    destination: Arc<dyn Destination>,
    namespace: String,
    name: String,
    locks: MergeLocks,
}

impl EndpointSync {
    pub fn new(
        api: ApiExtractor,
        destination: Arc<dyn Destination>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            destination,
            namespace: namespace.into(),
            name: name.into(),
            locks: MergeLocks::new(),
        }
    }

    pub fn with_locks(mut self, locks: MergeLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Run the endpoint pipeline. The load strategy governs the merge
    /// step; page selection is the paginate function's concern.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let endpoint = self.api.endpoint();
        endpoint.validate()?;

        let table = endpoint.table(&self.namespace, &self.name)?;
        let dest_name = table.destination_name();
        ensure_destination(self.destination.as_ref(), &table, &dest_name, &[]).await?;

        let columns = endpoint.column_names();
        let plan = Plan {
            staging: staging_name(&dest_name),
            dest_table: table,
            dest_name,
            all_columns: columns.clone(),
            columns,
        };
        info!(
            endpoint = %self.name,
            url = %endpoint.url,
            destination = %plan.dest_name,
            strategy = %endpoint.load.strategy,
            "starting endpoint sync"
        );

        let result = self.execute(&plan, cancel).await;
        drop_staging(self.destination.as_ref(), &plan.staging).await;

        let rows_loaded = result?;
        info!(endpoint = %self.name, rows = rows_loaded, "endpoint sync complete");
        Ok(SyncReport {
            table: self.name.clone(),
            destination_table: plan.dest_name,
            strategy: endpoint.load.strategy,
            rows_loaded,
        })
    }

    async fn execute(&self, plan: &Plan, cancel: &CancellationToken) -> Result<u64> {
        let endpoint = self.api.endpoint();
        let dialect = self.destination.engine().dialect();
        self.destination
            .exec(&dialect.render_create_staging(&plan.dest_name, &plan.staging)?)
            .await?;

        let (tx, rx) = mpsc::channel(8);
        let loader = self
            .destination
            .load_rows(&plan.staging, &plan.all_columns, rx);
        let fetch = self.api.fetch(cancel, tx);
        let (loaded, ()) = tokio::join!(loader, fetch);
        let rows_loaded = loaded?;

        merge(
            self.destination.as_ref(),
            &self.locks,
            plan,
            &endpoint.load.strategy,
            endpoint.load.primary_key(),
        )
        .await?;
        Ok(rows_loaded)
    }
}

fn staging_name(dest_name: &str) -> String {
    let run_id = Uuid::new_v4().simple().to_string();
    format!("staging_{}_{}", dest_name, &run_id[..8])
}

/// Quote a watermark value unless it is a plain decimal number.
/// Parsing alone is not enough: "NaN" and "inf" parse as f64 but are
/// not SQL numeric literals.
fn sql_literal(value: &str) -> String {
    let numeric = value.parse::<f64>().is_ok()
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'));
    if numeric {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Introspect the destination table, creating it from source metadata
/// (computed columns appended) when absent.
async fn ensure_destination(
    destination: &dyn Destination,
    source_table: &Table,
    dest_name: &str,
    computed: &[Column],
) -> Result<Table> {
    let exists = destination
        .table_names()
        .await?
        .iter()
        .any(|t| t == dest_name);
    if exists {
        return destination.dump_table_metadata(dest_name).await;
    }

    let mut columns = source_table.columns.clone();
    columns.extend(computed.iter().cloned());
    let dest_table = Table::new(source_table.source.clone(), dest_name, columns);

    let dialect = destination.engine().dialect();
    let ddl = dest_table.create_statement(dest_name, dialect);
    info!(table = %dest_name, "creating destination table");
    destination.exec(&ddl).await?;
    Ok(dest_table)
}

/// Merge staging into the destination inside one transaction, holding the
/// per-table lock for the duration. A failed merge rolls back and is
/// always fatal for the table's run; merges are never retried.
async fn merge(
    destination: &dyn Destination,
    locks: &MergeLocks,
    plan: &Plan,
    strategy: &LoadStrategy,
    primary_key: &str,
) -> Result<()> {
    let dialect = destination.engine().dialect();
    let sql = match strategy {
        LoadStrategy::Full => dialect.render_full_load(&plan.dest_name, &plan.staging)?,
        LoadStrategy::Incremental => {
            dialect.render_incremental_load(&plan.dest_name, &plan.staging)?
        }
        LoadStrategy::ModifiedOnly => dialect.render_modified_only_load(
            &plan.dest_table,
            &plan.dest_name,
            &plan.staging,
            primary_key,
        )?,
    };

    let lock = locks.lock_for(&plan.dest_name);
    let _guard = lock.lock_owned().await;

    let fail = |e: SyncError| SyncError::merge(&plan.dest_name, e.to_string());
    destination.begin().await.map_err(fail)?;
    if let Err(e) = destination.exec(&sql).await {
        if let Err(rollback) = destination.rollback().await {
            warn!(table = %plan.dest_name, "rollback after failed merge also failed: {rollback}");
        }
        return Err(SyncError::merge(&plan.dest_name, e.to_string()));
    }
    destination.commit().await.map_err(fail)?;
    debug!(table = %plan.dest_name, "merge committed");
    Ok(())
}

/// Drop the staging table, ignoring errors beyond a log line. Runs on
/// every pipeline outcome.
async fn drop_staging(destination: &dyn Destination, staging: &str) {
    let dialect = destination.engine().dialect();
    let sql = format!("DROP TABLE IF EXISTS {}", dialect.escape_identifier(staging));
    if let Err(e) = destination.exec(&sql).await {
        warn!(staging, "failed to drop staging table: {e}");
    }
}
