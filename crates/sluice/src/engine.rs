//! Extraction engine
//!
//! Drives one run end to end: crawl, diff against the previous snapshot,
//! plan, then extract every planned table with a bounded number of workers.
//! A table's failure is recorded in the [`RunReport`] and never fails the run;
//! only source and introspection failures do.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, CommitOutcome};
use crate::config::ExtractionConfig;
use crate::crawler::SchemaCrawler;
use crate::dialect::SqlDialect;
use crate::differ::diff;
use crate::error::{Error, ErrorCategory, Result};
use crate::extractor::RowExtractor;
use crate::planner::{plan, ExtractionMode, ExtractionPlan, ExtractionTask};
use crate::pool::ConnectionPool;
use crate::retry::retry_when;
use crate::schema::{SchemaProvider, SchemaSnapshot, SnapshotStore, TableId};
use crate::sink::SinkEmitter;
use crate::types::Value;

/// Final state of one table in a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    /// All rows delivered and committed
    Completed,
    /// Extraction stopped on an error
    Failed {
        /// Error category
        category: ErrorCategory,
        /// Error message
        message: String,
    },
    /// Stopped by cancellation
    Cancelled,
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed { category, .. } => write!(f, "failed ({})", category),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableReport {
    /// Table
    pub table: TableId,
    /// Planned mode
    pub mode: ExtractionMode,
    /// Final state
    pub status: TableStatus,
    /// Rows acknowledged by the sink
    pub rows: u64,
    /// Batches acknowledged by the sink
    pub batches: u64,
    /// Watermark stored at the end of the task, if any
    pub final_watermark: Option<Value>,
}

impl TableReport {
    fn new(task: &ExtractionTask) -> Self {
        Self {
            table: task.table_id().clone(),
            mode: task.mode,
            status: TableStatus::Completed,
            rows: 0,
            batches: 0,
            final_watermark: task.lower_bound.clone(),
        }
    }

    fn failed(mut self, err: &Error) -> Self {
        self.status = TableStatus::Failed {
            category: err.root_cause().category(),
            message: err.to_string(),
        };
        self
    }

    fn cancelled(mut self) -> Self {
        self.status = TableStatus::Cancelled;
        self
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Run start time
    pub started_at: DateTime<Utc>,
    /// Run end time
    pub finished_at: DateTime<Utc>,
    /// Capture time of the snapshot the run was planned from
    pub snapshot_captured_at: DateTime<Utc>,
    /// Per-table outcomes in plan order
    pub tables: Vec<TableReport>,
    /// Checkpoints invalidated by the plan
    pub invalidated: Vec<TableId>,
    /// Checkpoints orphaned by the plan
    pub orphaned: Vec<TableId>,
}

impl RunReport {
    /// Total rows delivered
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|t| t.rows).sum()
    }

    /// Tables that failed
    pub fn failed(&self) -> impl Iterator<Item = &TableReport> {
        self.tables
            .iter()
            .filter(|t| matches!(t.status, TableStatus::Failed { .. }))
    }

    /// Whether any table failed
    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Report for `table`
    pub fn table(&self, table: &TableId) -> Option<&TableReport> {
        self.tables.iter().find(|t| &t.table == table)
    }
}

struct EngineInner {
    pool: ConnectionPool,
    crawler: SchemaCrawler,
    checkpoints: Arc<dyn CheckpointStore>,
    snapshots: Arc<dyn SnapshotStore>,
    sink: Arc<dyn SinkEmitter>,
    extractor: RowExtractor,
    config: Arc<ExtractionConfig>,
}

/// Runs extractions against one source.
///
/// Cloning is cheap; clones share the pool and stores.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine
    pub fn new(
        pool: ConnectionPool,
        provider: Arc<dyn SchemaProvider>,
        dialect: Arc<dyn SqlDialect>,
        checkpoints: Arc<dyn CheckpointStore>,
        snapshots: Arc<dyn SnapshotStore>,
        sink: Arc<dyn SinkEmitter>,
        config: ExtractionConfig,
    ) -> Self {
        let config = Arc::new(config);
        let query_timeout = Duration::from_millis(pool.config().connection.query_timeout_ms);
        Self {
            inner: Arc::new(EngineInner {
                crawler: SchemaCrawler::new(provider, config.clone()),
                extractor: RowExtractor::new(dialect, config.batch_size, query_timeout),
                pool,
                checkpoints,
                snapshots,
                sink,
                config,
            }),
        }
    }

    /// Extraction settings
    pub fn config(&self) -> &ExtractionConfig {
        &self.inner.config
    }

    /// Checkpoint store
    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.checkpoints
    }

    /// Crawl the source without planning or extracting
    pub async fn discover(&self) -> Result<SchemaSnapshot> {
        let inner = &self.inner;
        let conn = inner.pool.get_with_retry(&inner.config.pool_retry).await?;
        inner.crawler.crawl(&*conn).await
    }

    /// Crawl, diff and plan without touching any state
    pub async fn plan(&self) -> Result<(SchemaSnapshot, ExtractionPlan)> {
        let snapshot = self.discover().await?;
        let plan = self.plan_for(&snapshot).await?;
        Ok((snapshot, plan))
    }

    async fn plan_for(&self, snapshot: &SchemaSnapshot) -> Result<ExtractionPlan> {
        let inner = &self.inner;
        let previous = inner
            .snapshots
            .load()
            .await?
            .unwrap_or_else(SchemaSnapshot::empty);
        let delta = diff(&previous, snapshot);
        info!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            altered = delta.altered.len(),
            "schema diffed against previous snapshot"
        );

        let checkpoints: HashMap<_, _> = inner
            .checkpoints
            .list()
            .await?
            .into_iter()
            .map(|cp| (cp.table.clone(), cp))
            .collect();
        Ok(plan(snapshot, &delta, &checkpoints, &inner.config))
    }

    /// Execute one run.
    ///
    /// Cancelling `cancel` stops new tables from starting; tables in flight
    /// finish the batch they are on, commit it, and stop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "extraction run started");

        let snapshot = self.discover().await?;
        let plan = self.plan_for(&snapshot).await?;
        self.apply_transitions(&plan).await?;
        self.inner.snapshots.save(&snapshot).await?;

        let invalidated = plan.invalidate.clone();
        let orphaned = plan.orphan.iter().map(|(id, _)| id.clone()).collect();
        let tables = self.execute(plan.tasks, &cancel).await;
        if let Err(e) = self.inner.sink.flush().await {
            warn!(%run_id, sink = self.inner.sink.name(), error = %e, "sink flush failed");
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            snapshot_captured_at: snapshot.captured_at(),
            tables,
            invalidated,
            orphaned,
        };
        info!(
            %run_id,
            tables = report.tables.len(),
            rows = report.total_rows(),
            failed = report.failed().count(),
            cancelled = cancel.is_cancelled(),
            "extraction run finished"
        );
        let pool = self.inner.pool.stats();
        debug!(
            connections = self.inner.pool.size(),
            acquisitions = pool.acquisitions,
            exhausted = pool.exhausted_count,
            avg_wait_ms = pool.avg_wait_time_ms(),
            "pool statistics"
        );
        Ok(report)
    }

    /// Execute runs until one gets past `SourceUnavailable` or the run retry
    /// policy is spent
    pub async fn run_with_retry(&self, cancel: CancellationToken) -> Result<RunReport> {
        retry_when(
            &self.inner.config.run_retry,
            "extraction run",
            |e| e.category() == ErrorCategory::SourceUnavailable && !cancel.is_cancelled(),
            || self.run(cancel.clone()),
        )
        .await
    }

    async fn apply_transitions(&self, plan: &ExtractionPlan) -> Result<()> {
        let store = &self.inner.checkpoints;
        for table in &plan.invalidate {
            if store.invalidate(table).await?.is_some() {
                info!(table = %table, "checkpoint invalidated");
            }
        }
        for (table, fingerprint) in &plan.orphan {
            if store.mark_orphaned(table, fingerprint).await?.is_some() {
                warn!(table = %table, "table removed from source; checkpoint orphaned");
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        tasks: Vec<ExtractionTask>,
        cancel: &CancellationToken,
    ) -> Vec<TableReport> {
        let concurrency = self
            .inner
            .config
            .effective_concurrency(self.inner.pool.max_size());
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut reports: Vec<Option<TableReport>> = vec![None; tasks.len()];
        let fallback: Vec<TableReport> = tasks.iter().map(TableReport::new).collect();
        let mut workers = JoinSet::new();

        debug!(tasks = tasks.len(), concurrency, "dispatching table workers");
        for (idx, task) in tasks.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                debug!(table = %task.table_id(), "not started before cancellation");
                reports[idx] = Some(TableReport::new(&task).cancelled());
                continue;
            };

            let inner = self.inner.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                (idx, extract_table(&inner, &task, &cancel).await)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((idx, report)) => reports[idx] = Some(report),
                Err(e) => error!(error = %e, "table worker panicked"),
            }
        }

        reports
            .into_iter()
            .zip(fallback)
            .map(|(report, fallback)| {
                report.unwrap_or_else(|| {
                    fallback.failed(&Error::internal("table worker terminated unexpectedly"))
                })
            })
            .collect()
    }
}

/// Extract one table: stream, emit, commit. Never returns an error; failures
/// are folded into the report.
async fn extract_table(
    inner: &EngineInner,
    task: &ExtractionTask,
    cancel: &CancellationToken,
) -> TableReport {
    let table = task.table_id();
    let mut report = TableReport::new(task);
    info!(
        table = %table,
        mode = %task.mode,
        reason = %task.reason,
        lower_bound = ?task.lower_bound,
        "table extraction started"
    );

    let conn = match inner.pool.get_with_retry(&inner.config.pool_retry).await {
        Ok(conn) => conn,
        Err(e) => {
            error!(table = %table, error = %e, "no connection for table");
            return report.failed(&e);
        }
    };

    let mut batches = Box::pin(inner.extractor.extract(&*conn, task));
    let mut full_watermark: Option<Value> = None;

    while let Some(next) = batches.next().await {
        let batch = match next {
            Ok(batch) => batch,
            Err(e) => {
                error!(table = %table, error = %e, rows = report.rows, "table extraction failed");
                return report.failed(&e);
            }
        };
        let watermark = batch.watermark.clone();
        let sequence = batch.sequence;

        let ack = match inner.sink.emit(table, batch).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(table = %table, batch = sequence, error = %e, "sink rejected batch");
                return report.failed(&e);
            }
        };
        report.rows += ack.rows as u64;
        report.batches += 1;

        match (task.mode, &task.watermark_column, watermark) {
            (ExtractionMode::Incremental, Some(column), Some(w)) => {
                match commit(inner, table, column, &w).await {
                    Ok(stored) => report.final_watermark = Some(stored),
                    Err(e) => return report.failed(&e),
                }
            }
            (ExtractionMode::Full, Some(_), w) => full_watermark = w.or(full_watermark),
            _ => {}
        }
        debug!(
            table = %table,
            batch = sequence,
            rows = ack.rows,
            watermark = ?report.final_watermark,
            "batch delivered"
        );

        if cancel.is_cancelled() {
            info!(table = %table, rows = report.rows, "table stopped by cancellation");
            return report.cancelled();
        }
    }

    // FULL output is only complete at end of table
    if let (ExtractionMode::Full, Some(column), Some(w)) =
        (task.mode, &task.watermark_column, full_watermark)
    {
        match commit(inner, table, column, &w).await {
            Ok(stored) => report.final_watermark = Some(stored),
            Err(e) => return report.failed(&e),
        }
    }

    info!(
        table = %table,
        rows = report.rows,
        batches = report.batches,
        watermark = ?report.final_watermark,
        "table extraction completed"
    );
    report
}

async fn commit(inner: &EngineInner, table: &TableId, column: &str, w: &Value) -> Result<Value> {
    match inner.checkpoints.commit(table, column, w).await {
        Ok(CommitOutcome::Committed(cp)) => Ok(cp.watermark),
        Ok(CommitOutcome::Ignored(cp)) => {
            warn!(
                table = %table,
                offered = %w,
                stored = %cp.watermark,
                "watermark behind stored checkpoint; commit ignored"
            );
            Ok(cp.watermark)
        }
        Err(e) => {
            error!(table = %table, error = %e, "checkpoint commit failed");
            Err(e)
        }
    }
}
