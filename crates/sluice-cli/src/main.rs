//! sluice - incremental extraction from relational databases
//!
//! # Usage
//!
//! ```bash
//! # Extract everything new since the last run
//! sluice -c sluice.yaml run
//!
//! # Export the source schema as CSV
//! sluice -c sluice.yaml discover --format csv --output schema.csv
//!
//! # Inspect and reset progress
//! sluice -c sluice.yaml checkpoints list
//! sluice -c sluice.yaml checkpoints reset public.orders
//!
//! # Validate configuration
//! sluice -c sluice.yaml validate
//! ```

mod config;
mod render;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice::prelude::*;

use config::{SinkKind, SluiceConfig, StateBackend};
use render::{ReportFormat, SnapshotFormat};

#[derive(Parser)]
#[command(name = "sluice")]
#[command(version, about = "Schema-driven incremental extraction from relational databases")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "sluice.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl, plan and extract all tables once (default)
    Run {
        /// Report format
        #[arg(long, value_enum, default_value = "table")]
        format: ReportFormat,
    },
    /// Crawl the source schema and print it
    Discover {
        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: SnapshotFormat,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the extraction plan without extracting
    Plan {
        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: ReportFormat,
    },
    /// Inspect or reset stored checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Validate configuration file
    Validate,
    /// Print the JSON schema of the configuration file
    Schema,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List all checkpoints
    List {
        /// Output format
        #[arg(long, value_enum, default_value = "table")]
        format: ReportFormat,
    },
    /// Invalidate a table's checkpoint so the next run extracts it in full
    Reset {
        /// Table as `schema.name` or `name`
        table: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Commands that don't need config
    if let Some(Commands::Schema) = &cli.command {
        return show_schema();
    }

    let config = SluiceConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run {
        format: ReportFormat::Table,
    }) {
        Commands::Run { format } => run(config, format).await,
        Commands::Discover { format, output } => discover(config, format, output).await,
        Commands::Plan { format } => show_plan(config, format).await,
        Commands::Checkpoints { action } => checkpoints(config, action).await,
        Commands::Validate => validate_config(&config),
        Commands::Schema => show_schema(),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn connect(config: &SluiceConfig) -> Result<ConnectionPool> {
    let driver = config.source.driver;
    let pool = ConnectionPool::new(
        PoolConfig::from_connection(config.source.clone()),
        driver.connection_factory()?,
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.source.redacted_target()))?;
    Ok(pool)
}

async fn open_checkpoints(config: &SluiceConfig) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match config.state.backend {
        StateBackend::File => {
            let dir = config.state.checkpoint_dir();
            Arc::new(
                FileCheckpointStore::new(&dir)
                    .await
                    .with_context(|| format!("Failed to open checkpoints in {}", dir.display()))?,
            )
        }
        StateBackend::Memory => {
            warn!("memory state backend: checkpoints are discarded when the process exits");
            Arc::new(MemoryCheckpointStore::new())
        }
        StateBackend::Postgres => open_postgres_checkpoints(config).await?,
    };
    Ok(store)
}

#[cfg(feature = "postgres")]
async fn open_postgres_checkpoints(config: &SluiceConfig) -> Result<Arc<dyn CheckpointStore>> {
    let store = PostgresCheckpointStore::connect(&config.source, config.state.table.as_deref())
        .await
        .context("Failed to open checkpoint table")?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres_checkpoints(_config: &SluiceConfig) -> Result<Arc<dyn CheckpointStore>> {
    anyhow::bail!("PostgreSQL support not compiled in");
}

async fn open_snapshots(config: &SluiceConfig) -> Result<Arc<dyn SnapshotStore>> {
    if config.state.backend == StateBackend::Memory {
        return Ok(Arc::new(MemorySnapshotStore::new()));
    }
    let path = config.state.snapshot_path();
    let store = FileSnapshotStore::new(&path)
        .await
        .with_context(|| format!("Failed to open snapshot store {}", path.display()))?;
    Ok(Arc::new(store))
}

async fn open_sink(config: &SluiceConfig) -> Result<Arc<dyn SinkEmitter>> {
    Ok(match config.sink.kind {
        SinkKind::Jsonl => Arc::new(
            JsonLinesFileSink::new(&config.sink.dir)
                .await
                .with_context(|| format!("Failed to open sink dir {}", config.sink.dir.display()))?,
        ),
        SinkKind::Stdout => Arc::new(StdoutSink::new(config.sink.format)),
    })
}

async fn build_engine(config: &SluiceConfig) -> Result<Engine> {
    let pool = connect(config).await?;
    let dialect = config.source.driver.dialect();
    Ok(Engine::new(
        pool,
        Arc::new(CatalogSchemaProvider::new(dialect.clone())),
        dialect,
        open_checkpoints(config).await?,
        open_snapshots(config).await?,
        open_sink(config).await?,
        config.extraction.clone(),
    ))
}

/// Print to stdout, or stderr when stdout carries sink output
fn emit_text(text: &str, to_stderr: bool) -> Result<()> {
    if to_stderr {
        std::io::stderr().write_all(text.as_bytes())?;
    } else {
        std::io::stdout().write_all(text.as_bytes())?;
    }
    Ok(())
}

async fn run(config: SluiceConfig, format: ReportFormat) -> Result<()> {
    info!(source = %config.source.redacted_target(), "Starting sluice run");
    let engine = build_engine(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight batches");
            on_signal.cancel();
        }
    });

    let report = engine
        .run_with_retry(cancel.clone())
        .await
        .context("Extraction run failed")?;

    emit_text(
        &render::run_report(&report, format)?,
        config.sink.kind == SinkKind::Stdout,
    )?;

    if report.has_failures() {
        anyhow::bail!("{} table(s) failed", report.failed().count());
    }
    if cancel.is_cancelled() {
        anyhow::bail!("run cancelled");
    }
    Ok(())
}

async fn discover(
    config: SluiceConfig,
    format: SnapshotFormat,
    output: Option<PathBuf>,
) -> Result<()> {
    let pool = connect(&config).await?;
    let crawler = SchemaCrawler::new(
        Arc::new(CatalogSchemaProvider::new(config.source.driver.dialect())),
        Arc::new(config.extraction.clone()),
    );
    let snapshot = {
        let conn = pool.get().await?;
        crawler.crawl(&*conn).await.context("Discover failed")?
    };
    pool.close().await?;

    let text = render::snapshot(&snapshot, format)?;
    match output {
        Some(path) => {
            std::fs::write(&path, text)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                tables = snapshot.tables().len(),
                path = %path.display(),
                "Schema written"
            );
        }
        None => emit_text(&text, false)?,
    }
    Ok(())
}

async fn show_plan(config: SluiceConfig, format: ReportFormat) -> Result<()> {
    let engine = build_engine(&config).await?;
    let (_, plan) = engine.plan().await.context("Planning failed")?;

    match format {
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        ReportFormat::Table => {
            for task in &plan.tasks {
                let bound = task
                    .lower_bound
                    .as_ref()
                    .map(|v| format!(" > {}", v))
                    .unwrap_or_default();
                println!(
                    "  {:<12} {}{} ({})",
                    task.mode.to_string(),
                    task.table_id(),
                    bound,
                    task.reason
                );
            }
            for table in &plan.invalidate {
                println!("  invalidate   {}", table);
            }
            for (table, _) in &plan.orphan {
                println!("  orphan       {}", table);
            }
        }
    }
    Ok(())
}

async fn checkpoints(config: SluiceConfig, action: CheckpointAction) -> Result<()> {
    let store = open_checkpoints(&config).await?;
    match action {
        CheckpointAction::List { format } => {
            let list = store.list().await?;
            emit_text(&render::checkpoints(&list, format)?, false)
        }
        CheckpointAction::Reset { table } => {
            let id = TableId::parse(&table)?;
            match store.invalidate(&id).await? {
                Some(cp) => {
                    println!(
                        "✓ Checkpoint for {} invalidated (was {} = {})",
                        id, cp.watermark_column, cp.watermark
                    );
                    Ok(())
                }
                None => anyhow::bail!("No checkpoint stored for {}", id),
            }
        }
    }
}

fn validate_config(config: &SluiceConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");

    println!("Source:");
    println!("  Target: {}", config.source.redacted_target());
    println!("  Pool size: {}", config.source.max_pool_size);
    println!("  Query timeout: {}ms", config.source.query_timeout_ms);
    println!();

    let extraction = &config.extraction;
    println!("Extraction:");
    println!("  Batch size: {}", extraction.batch_size);
    println!(
        "  Concurrent tables: {}",
        extraction.effective_concurrency(config.source.max_pool_size)
    );
    for (table, column) in &extraction.incremental_key_overrides {
        println!("  Key override: {} -> {}", table, column);
    }
    for table in &extraction.full_reload_tables {
        println!("  Full reload: {}", table);
    }
    println!();

    println!("State: {:?} ({})", config.state.backend, config.state.dir.display());
    match config.sink.kind {
        SinkKind::Jsonl => println!("Sink: jsonl ({})", config.sink.dir.display()),
        SinkKind::Stdout => println!("Sink: stdout ({:?})", config.sink.format),
    }
    Ok(())
}

fn show_schema() -> Result<()> {
    let schema = schemars::schema_for!(SluiceConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
