//! Sink emitter boundary
//!
//! The engine hands each batch to a `SinkEmitter` and advances the table's
//! checkpoint only after the emitter acknowledges it. An emitter must not ack
//! a batch before the rows are durable on its side.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::extractor::RecordBatch;
use crate::schema::TableId;
use crate::types::Row;

/// Acknowledgement of a delivered batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkAck {
    /// Table the batch came from
    pub table: TableId,
    /// Batch sequence within the table stream
    pub sequence: u64,
    /// Rows accepted
    pub rows: usize,
}

impl SinkAck {
    /// Acknowledge all of `batch`
    pub fn for_batch(batch: &RecordBatch) -> Self {
        Self {
            table: batch.table.clone(),
            sequence: batch.sequence,
            rows: batch.len(),
        }
    }
}

/// Downstream consumer of record batches
#[async_trait]
pub trait SinkEmitter: Send + Sync {
    /// Deliver `batch`; the returned ack means the rows are durable downstream
    async fn emit(&self, table: &TableId, batch: RecordBatch) -> Result<SinkAck>;

    /// Flush buffered output
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Short name for logs
    fn name(&self) -> &str;
}

fn row_line(table: &TableId, sequence: u64, row: &Row) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&serde_json::json!({
        "table": table.qualified_name(),
        "batch": sequence,
        "row": row.to_json(),
    }))?;
    line.push(b'\n');
    Ok(line)
}

// ============================================================================
// JSON-lines file sink
// ============================================================================

/// Appends each table's rows to `<dir>/<table>.jsonl`.
///
/// A batch is acked after it is written and synced to disk.
pub struct JsonLinesFileSink {
    dir: PathBuf,
    files: DashMap<TableId, Arc<tokio::sync::Mutex<File>>>,
}

impl JsonLinesFileSink {
    /// Create a sink writing into `dir` (created if missing)
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create sink directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            files: DashMap::new(),
        })
    }

    /// Output file for `table`
    pub fn file_path(&self, table: &TableId) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", crate::stores::file_stem(table)))
    }

    async fn file_for(&self, table: &TableId) -> Result<Arc<tokio::sync::Mutex<File>>> {
        if let Some(file) = self.files.get(table) {
            return Ok(file.clone());
        }
        let path = self.file_path(table);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                Error::sink(
                    table.to_string(),
                    format!("cannot open {}: {}", path.display(), e),
                )
            })?;
        Ok(self
            .files
            .entry(table.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(file)))
            .clone())
    }
}

#[async_trait]
impl SinkEmitter for JsonLinesFileSink {
    async fn emit(&self, table: &TableId, batch: RecordBatch) -> Result<SinkAck> {
        let mut buf = Vec::new();
        for row in &batch.rows {
            buf.extend(row_line(table, batch.sequence, row)?);
        }

        let file = self.file_for(table).await?;
        let mut file = file.lock().await;
        let write = async {
            file.write_all(&buf).await?;
            file.flush().await?;
            file.sync_data().await
        };
        write
            .await
            .map_err(|e| Error::sink(table.to_string(), format!("write failed: {}", e)))?;

        debug!(table = %table, batch = batch.sequence, rows = batch.len(), "batch written");
        Ok(SinkAck::for_batch(&batch))
    }

    async fn flush(&self) -> Result<()> {
        let handles: Vec<(TableId, Arc<tokio::sync::Mutex<File>>)> = self
            .files
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (table, handle) in handles {
            let mut file = handle.lock().await;
            file.flush()
                .await
                .map_err(|e| Error::sink(table.to_string(), format!("flush failed: {}", e)))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

// ============================================================================
// Stdout sink
// ============================================================================

/// Output format for [`StdoutSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StdoutFormat {
    /// One compact JSON object per row
    #[default]
    Json,
    /// Indented JSON per row
    Pretty,
}

/// Writes rows to stdout, mostly for debugging
#[derive(Debug, Default)]
pub struct StdoutSink {
    format: StdoutFormat,
    out: tokio::sync::Mutex<()>,
}

impl StdoutSink {
    /// Create a stdout sink
    pub fn new(format: StdoutFormat) -> Self {
        Self {
            format,
            out: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl SinkEmitter for StdoutSink {
    async fn emit(&self, table: &TableId, batch: RecordBatch) -> Result<SinkAck> {
        let mut buf = Vec::new();
        for row in &batch.rows {
            match self.format {
                StdoutFormat::Json => buf.extend(row_line(table, batch.sequence, row)?),
                StdoutFormat::Pretty => {
                    let value = serde_json::json!({
                        "table": table.qualified_name(),
                        "batch": batch.sequence,
                        "row": row.to_json(),
                    });
                    buf.extend(serde_json::to_vec_pretty(&value)?);
                    buf.push(b'\n');
                }
            }
        }

        // keep batches from different tables from interleaving
        let _guard = self.out.lock().await;
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(&buf)
            .await
            .map_err(|e| Error::sink(table.to_string(), format!("stdout write failed: {}", e)))?;
        stdout
            .flush()
            .await
            .map_err(|e| Error::sink(table.to_string(), format!("stdout flush failed: {}", e)))?;
        Ok(SinkAck::for_batch(&batch))
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

type EmitHook = Box<dyn Fn(&RecordBatch) + Send + Sync>;

/// Collects batches in memory; can be told to reject a batch
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<RecordBatch>>,
    fail_on: Mutex<Option<(TableId, u64)>>,
    hook: Option<EmitHook>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject batch `sequence` of `table` (1-based)
    pub fn fail_on(self, table: TableId, sequence: u64) -> Self {
        *self.fail_on.lock() = Some((table, sequence));
        self
    }

    /// Run `hook` on every batch before it is accepted
    pub fn on_emit(mut self, hook: impl Fn(&RecordBatch) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// All accepted batches in delivery order
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.batches.lock().clone()
    }

    /// Accepted batches of `table`
    pub fn batches_for(&self, table: &TableId) -> Vec<RecordBatch> {
        self.batches
            .lock()
            .iter()
            .filter(|b| &b.table == table)
            .cloned()
            .collect()
    }

    /// Accepted rows of `table`
    pub fn rows_for(&self, table: &TableId) -> Vec<Row> {
        self.batches_for(table)
            .into_iter()
            .flat_map(|b| b.rows)
            .collect()
    }
}

#[async_trait]
impl SinkEmitter for MemorySink {
    async fn emit(&self, table: &TableId, batch: RecordBatch) -> Result<SinkAck> {
        if let Some(hook) = &self.hook {
            hook(&batch);
        }
        let rejected = self
            .fail_on
            .lock()
            .as_ref()
            .is_some_and(|(t, seq)| t == table && *seq == batch.sequence);
        if rejected {
            return Err(Error::sink(
                table.to_string(),
                format!("batch {} rejected", batch.sequence),
            ));
        }
        let ack = SinkAck::for_batch(&batch);
        self.batches.lock().push(batch);
        Ok(ack)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
