//! tablesync CLI - synchronize tables and HTTP APIs into a data warehouse.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use tablesync::{
    ApiExtractor, Connection, Destination, EndpointSync, Engine, Orchestrator, PostgresConnection,
    Registry, ScriptEngine, SyncError, TableExtract, TableJob,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "Synchronize relational tables and HTTP APIs into a data warehouse")]
#[command(version)]
struct Cli {
    /// Path to the YAML database registry
    #[arg(short, long, default_value = "databases.yaml")]
    databases: PathBuf,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize database tables into a destination warehouse
    Extract {
        /// Source database name in the registry
        source: String,

        /// Destination database name in the registry
        destination: String,

        /// Tables to extract; defaults to every table on the source
        tables: Vec<String>,

        /// Lua extract configuration script
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Synchronize an HTTP endpoint into a destination warehouse
    ExtractApi {
        /// Lua endpoint configuration script
        script: PathBuf,

        /// Endpoint name, used in the destination table name
        name: String,

        /// Destination database name in the registry
        destination: String,

        /// Namespace prefixing the destination table name
        #[arg(long, default_value = "api")]
        namespace: String,
    },

    /// Show engine and connectivity information for a database
    AboutDb {
        /// Database name in the registry
        database: String,
    },

    /// List the tables visible on a database
    ListTables {
        /// Database name in the registry
        database: String,
    },

    /// Show the canonical schema of a table
    DescribeTable {
        /// Database name in the registry
        database: String,

        /// Table to describe
        table: String,
    },

    /// Drop a table
    DropTable {
        /// Database name in the registry
        database: String,

        /// Table to drop
        table: String,
    },

    /// Create a table from a YAML definition file
    CreateTable {
        /// Database name in the registry
        database: String,

        /// YAML table definition file
        file: PathBuf,
    },

    /// Launch the database's interactive terminal
    Terminal {
        /// Database name in the registry
        database: String,
    },
}

/// YAML table definition accepted by `create-table`.
#[derive(Deserialize)]
struct TableDefinitionFile {
    table: String,
    columns: Vec<ColumnDefinition>,
}

#[derive(Deserialize)]
struct ColumnDefinition {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run() -> Result<u8, SyncError> {
    let cli = Cli::parse();
    setup_logging(&cli.verbosity, &cli.log_format);

    let registry = Registry::load(&cli.databases)?;
    info!("loaded database registry from {:?}", cli.databases);

    // Terminal replaces this process's foreground; no cancellation needed.
    if let Commands::Terminal { database } = &cli.command {
        return launch_terminal(&registry, database);
    }

    let cancel = setup_signal_handler();

    match cli.command {
        Commands::Terminal { .. } => unreachable!(),

        Commands::Extract {
            source,
            destination,
            tables,
            script,
        } => {
            let source_conn: Arc<dyn Connection> = Arc::new(connect(&registry, &source).await?);
            let dest_conn = connect_destination(&registry, &destination).await?;

            let script = match script {
                Some(path) => Some(ScriptEngine::load_tables_file(&path)?),
                None => None,
            };

            let tables = if tables.is_empty() {
                source_conn.table_names().await?
            } else {
                tables
            };

            let mut orchestrator = Orchestrator::new();
            for table in tables {
                let extract = match &script {
                    Some(engine) => engine.table_extract(&table)?,
                    None => TableExtract::default_full(),
                };
                orchestrator.add_table(TableJob {
                    source: Arc::clone(&source_conn),
                    destination: Arc::clone(&dest_conn),
                    table,
                    extract,
                });
            }

            let report = orchestrator.run(&cancel).await;
            for sync in &report.succeeded {
                println!(
                    "{} -> {} ({}): {} rows",
                    sync.table, sync.destination_table, sync.strategy, sync.rows_loaded
                );
            }
            for (table, error) in &report.failed {
                eprintln!("{table}: {error}");
            }
            Ok(u8::try_from(report.exit_code()).unwrap_or(1))
        }

        Commands::ExtractApi {
            script,
            name,
            destination,
            namespace,
        } => {
            let dest_conn = connect_destination(&registry, &destination).await?;
            let engine = ScriptEngine::load_endpoint_file(&script)?;
            let api = ApiExtractor::new(engine.endpoint()?)?;

            let report = EndpointSync::new(api, dest_conn, namespace, name)
                .run(&cancel)
                .await?;
            println!(
                "{} -> {} ({}): {} rows",
                report.table, report.destination_table, report.strategy, report.rows_loaded
            );
            Ok(0)
        }

        Commands::AboutDb { database } => {
            let entry = registry.get(&database)?;
            let dialect = entry.engine().dialect();
            println!("Database: {database}");
            println!("  Engine: {}", dialect.human_name);
            let conn = connect(&registry, &database).await?;
            let tables = conn.table_names().await?;
            println!("  Connected: yes ({} tables)", tables.len());
            Ok(0)
        }

        Commands::ListTables { database } => {
            let conn = connect(&registry, &database).await?;
            for table in conn.table_names().await? {
                println!("{table}");
            }
            Ok(0)
        }

        Commands::DescribeTable { database, table } => {
            let conn = connect(&registry, &database).await?;
            let metadata = conn.dump_table_metadata(&table).await?;
            for column in &metadata.columns {
                println!("{} {}", column.name, column.render_ddl());
            }
            Ok(0)
        }

        Commands::DropTable { database, table } => {
            let conn = connect(&registry, &database).await?;
            let sql = format!("DROP TABLE {}", conn.escape_identifier(&table));
            conn.exec(&sql).await?;
            println!("Dropped table {table} on {database}");
            Ok(0)
        }

        Commands::CreateTable { database, file } => {
            let yaml = std::fs::read_to_string(&file)?;
            let definition: TableDefinitionFile = serde_yaml::from_str(&yaml)?;

            let mut columns = Vec::with_capacity(definition.columns.len());
            for column in &definition.columns {
                let (data_type, options) =
                    tablesync::schema::parse_database_type(&column.name, &column.column_type)?;
                columns.push(tablesync::Column {
                    name: column.name.clone(),
                    data_type,
                    options,
                });
            }
            let table = tablesync::Table::new(&database, &definition.table, columns);

            let conn = connect(&registry, &database).await?;
            let ddl = table.create_statement(&definition.table, conn.engine().dialect());
            conn.exec(&ddl).await?;
            println!("Created table {} on {database}", definition.table);
            Ok(0)
        }
    }
}

/// Open a connection to a registry entry.
///
/// This binary bundles the PostgreSQL driver; other engines plug in
/// through the library's `Connection` trait.
async fn connect(registry: &Registry, name: &str) -> Result<PostgresConnection, SyncError> {
    let entry = registry.get(name)?;
    match entry.engine() {
        Engine::Postgres => PostgresConnection::connect(name, entry).await,
        other => Err(SyncError::Config(format!(
            "the '{other}' driver is not bundled with this binary; use the library with a custom connection"
        ))),
    }
}

async fn connect_destination(
    registry: &Registry,
    name: &str,
) -> Result<Arc<dyn Destination>, SyncError> {
    if registry.get(name)?.readonly {
        return Err(SyncError::Config(format!(
            "connection '{name}' is readonly and cannot be used as a destination"
        )));
    }
    Ok(Arc::new(connect(registry, name).await?))
}

fn launch_terminal(registry: &Registry, database: &str) -> Result<u8, SyncError> {
    let entry = registry.get(database)?;
    let dialect = entry.engine().dialect();
    if dialect.terminal_command.is_empty() {
        return Err(SyncError::Config(format!(
            "the {} dialect has no interactive terminal",
            dialect.human_name
        )));
    }

    let status = std::process::Command::new(dialect.terminal_command)
        .arg(&entry.url)
        .status()?;
    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1))
}

fn setup_logging(verbosity: &str, format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity.to_string()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// SIGINT and SIGTERM cancel the run; pipelines unwind through their
/// cleanup paths before the process exits.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();

    let token_int = cancel.clone();
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to set up SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT, cancelling run...");
        token_int.cancel();
    });

    let token_term = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to set up SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM, cancelling run...");
        token_term.cancel();
    });

    cancel
}

#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to set up Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C, cancelling run...");
        token.cancel();
    });
    cancel
}
