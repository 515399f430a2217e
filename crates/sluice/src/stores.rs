//! # Durable Store Implementations
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryCheckpointStore` / `MemorySnapshotStore` | Testing, ephemeral runs |
//! | `FileCheckpointStore` / `FileSnapshotStore` | Single-node production |
//! | `PostgresCheckpointStore` | Shared metadata database (feature `postgres`) |
//!
//! State belongs next to the extraction, never in the source database.
//!
//! ## File layout
//!
//! ```text
//! state_dir/
//!   checkpoints/
//!     public.orders.json
//!   snapshot.json
//! ```
//!
//! Every write goes to a temp file first and is renamed into place.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::checkpoint::{
    apply_commit, apply_invalidate, apply_orphan, Checkpoint, CheckpointStore, CommitOutcome,
};
use crate::error::{Error, Result};
use crate::schema::{SchemaSnapshot, SnapshotStore, TableId};
use crate::types::Value;

/// Write `value` as pretty JSON via temp file + rename.
///
/// The temp file is synced before the rename, so the new content is on disk
/// before it becomes visible under `path`.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await
}

// ============================================================================
// File-based Checkpoint Store
// ============================================================================

/// File-based checkpoint store.
///
/// One JSON file per table, an in-memory cache loaded at startup, and a lock
/// per table so commits for one table are serialized while different tables
/// proceed independently.
///
/// # Example
///
/// ```rust,ignore
/// use sluice::stores::FileCheckpointStore;
///
/// let store = FileCheckpointStore::new("/var/lib/sluice/checkpoints").await?;
/// if let Some(cp) = store.load(&table).await? {
///     println!("resuming {} after {}", cp.table, cp.watermark);
/// }
/// ```
pub struct FileCheckpointStore {
    dir: PathBuf,
    cache: RwLock<HashMap<TableId, Checkpoint>>,
    locks: DashMap<TableId, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    /// Create a store in `dir`, creating it if needed and loading existing files
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| {
            Error::config(format!(
                "failed to create checkpoint directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let store = Self {
            dir,
            cache: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
        };
        store.load_all().await?;
        Ok(store)
    }

    /// Directory holding the checkpoint files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, table: &TableId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(table)))
    }

    fn lock_for(&self, table: &TableId) -> Arc<Mutex<()>> {
        self.locks
            .entry(table.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            Error::config(format!(
                "failed to read checkpoint directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut cache = self.cache.write().await;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::config(format!("failed to read directory entry: {}", e)))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match fs::read(&path).await {
                Ok(content) => match serde_json::from_slice::<Checkpoint>(&content) {
                    Ok(cp) => {
                        cache.insert(cp.table.clone(), cp);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint file"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read checkpoint file"),
            }
        }

        if !cache.is_empty() {
            debug!(count = cache.len(), dir = %self.dir.display(), "loaded checkpoints");
        }
        Ok(())
    }

    async fn persist(&self, cp: &Checkpoint) -> Result<()> {
        let path = self.file_path(&cp.table);
        write_json_atomic(&path, cp).await.map_err(|e| {
            Error::checkpoint_write_with(
                cp.table.to_string(),
                format!("failed to write {}", path.display()),
                e,
            )
        })?;
        self.cache.write().await.insert(cp.table.clone(), cp.clone());
        Ok(())
    }

    async fn cached(&self, table: &TableId) -> Option<Checkpoint> {
        self.cache.read().await.get(table).cloned()
    }
}

/// File name for a table: the qualified name when every part is path-safe,
/// else a hash. A part containing a dot is never path-safe, so distinct
/// identities never share a plain name.
pub(crate) fn file_stem(table: &TableId) -> String {
    use sha2::{Digest, Sha256};

    let safe = [&table.catalog, &table.schema]
        .into_iter()
        .flatten()
        .chain(std::iter::once(&table.name))
        .all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        });
    if safe {
        return table.qualified_name();
    }

    // hash every part length-prefixed so the digest input is unambiguous too
    let mut hasher = Sha256::new();
    for part in [&table.catalog, &table.schema] {
        match part {
            Some(p) => {
                hasher.update([1u8]);
                hasher.update((p.len() as u64).to_be_bytes());
                hasher.update(p.as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    hasher.update((table.name.len() as u64).to_be_bytes());
    hasher.update(table.name.as_bytes());
    format!("t-{}", &hex::encode(hasher.finalize())[..32])
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn commit(
        &self,
        table: &TableId,
        column: &str,
        watermark: &Value,
    ) -> Result<CommitOutcome> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let existing = self.cached(table).await;
        let outcome = apply_commit(existing.as_ref(), table, column, watermark, Utc::now())?;
        if let CommitOutcome::Committed(cp) = &outcome {
            self.persist(cp).await?;
            debug!(table = %table, watermark = %cp.watermark, sequence = cp.sequence, "checkpoint committed");
        }
        Ok(outcome)
    }

    async fn load(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        Ok(self.cached(table).await)
    }

    async fn invalidate(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let Some(existing) = self.cached(table).await else {
            return Ok(None);
        };
        match apply_invalidate(&existing, Utc::now()) {
            Some(next) => {
                self.persist(&next).await?;
                Ok(Some(next))
            }
            None => Ok(Some(existing)),
        }
    }

    async fn mark_orphaned(
        &self,
        table: &TableId,
        fingerprint: &str,
    ) -> Result<Option<Checkpoint>> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let Some(existing) = self.cached(table).await else {
            return Ok(None);
        };
        match apply_orphan(&existing, fingerprint, Utc::now()) {
            Some(next) => {
                self.persist(&next).await?;
                Ok(Some(next))
            }
            None => Ok(Some(existing)),
        }
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = self.cache.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(all)
    }
}

// ============================================================================
// File-based Snapshot Store
// ============================================================================

/// Keeps the last planned schema snapshot in a single JSON file
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store the snapshot at `path`; the parent directory is created if needed
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "failed to create snapshot directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(Self { path })
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<SchemaSnapshot>> {
        match fs::read(&self.path).await {
            Ok(content) => {
                let snapshot = serde_json::from_slice(&content).map_err(|e| {
                    Error::internal(format!(
                        "corrupt schema snapshot {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        write_json_atomic(&self.path, snapshot).await?;
        debug!(path = %self.path.display(), tables = snapshot.len(), "schema snapshot saved");
        Ok(())
    }
}

// ============================================================================
// PostgreSQL Checkpoint Store (Metadata Database)
// ============================================================================

/// PostgreSQL-backed checkpoint store for a dedicated metadata database.
///
/// Mutations are compare-and-set on the sequence number, so concurrent
/// writers to one table never interleave a read-modify-write.
///
/// # Table Schema
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS _sluice_checkpoints (
///     table_id TEXT PRIMARY KEY,
///     checkpoint JSONB NOT NULL,
///     sequence_number BIGINT NOT NULL,
///     last_updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
#[cfg(feature = "postgres")]
pub struct PostgresCheckpointStore {
    client: Arc<tokio_postgres::Client>,
    table_name: String,
}

#[cfg(feature = "postgres")]
const CAS_ATTEMPTS: usize = 5;

#[cfg(feature = "postgres")]
impl PostgresCheckpointStore {
    /// Default metadata table name
    pub const DEFAULT_TABLE: &'static str = "_sluice_checkpoints";

    /// Create the store, creating the metadata table if needed
    pub async fn new(
        client: Arc<tokio_postgres::Client>,
        table_name: Option<&str>,
    ) -> Result<Self> {
        let table_name = table_name.unwrap_or(Self::DEFAULT_TABLE).to_string();
        crate::security::validate_sql_identifier(&table_name)?;

        let store = Self { client, table_name };
        store.ensure_table().await?;
        Ok(store)
    }

    /// Connect to the metadata database described by `config`
    pub async fn connect(
        config: &crate::connection::ConnectionConfig,
        table_name: Option<&str>,
    ) -> Result<Self> {
        let client = crate::postgres::connect_client(config).await?;
        Self::new(Arc::new(client), table_name).await
    }

    async fn ensure_table(&self) -> Result<()> {
        let query = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                table_id TEXT PRIMARY KEY,
                checkpoint JSONB NOT NULL,
                sequence_number BIGINT NOT NULL,
                last_updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            self.table_name
        );
        self.client.execute(&query, &[]).await.map_err(|e| {
            Error::source_unavailable_with("failed to create checkpoint table", e)
        })?;
        Ok(())
    }

    async fn fetch(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        let query = format!(
            "SELECT checkpoint FROM {} WHERE table_id = $1",
            self.table_name
        );
        let row = self
            .client
            .query_opt(&query, &[&table.qualified_name()])
            .await
            .map_err(|e| {
                Error::checkpoint_write_with(table.to_string(), "failed to read checkpoint", e)
            })?;
        row.map(|r| {
            let json: serde_json::Value = r.get(0);
            serde_json::from_value(json).map_err(|e| {
                Error::checkpoint_write(table.to_string(), format!("corrupt checkpoint: {}", e))
            })
        })
        .transpose()
    }

    /// Write `next` if the stored row still has `expected` sequence (or is absent
    /// when `expected` is `None`). Returns whether the write happened.
    async fn compare_and_set(&self, next: &Checkpoint, expected: Option<u64>) -> Result<bool> {
        let table = next.table.to_string();
        let json = serde_json::to_value(next)
            .map_err(|e| Error::checkpoint_write(table.clone(), e.to_string()))?;
        let sequence = next.sequence as i64;

        let written = match expected {
            None => {
                let query = format!(
                    "INSERT INTO {} (table_id, checkpoint, sequence_number, last_updated_at) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT (table_id) DO NOTHING",
                    self.table_name
                );
                self.client
                    .execute(&query, &[&table, &json, &sequence, &next.last_updated_at])
                    .await
            }
            Some(expected) => {
                let query = format!(
                    "UPDATE {} SET checkpoint = $2, sequence_number = $3, last_updated_at = $4 \
                     WHERE table_id = $1 AND sequence_number = $5",
                    self.table_name
                );
                self.client
                    .execute(
                        &query,
                        &[
                            &table,
                            &json,
                            &sequence,
                            &next.last_updated_at,
                            &(expected as i64),
                        ],
                    )
                    .await
            }
        }
        .map_err(|e| Error::checkpoint_write_with(table, "failed to write checkpoint", e))?;

        Ok(written == 1)
    }

    /// Read-modify-write loop over `transition`
    async fn update<F>(&self, table: &TableId, transition: F) -> Result<Option<Checkpoint>>
    where
        F: Fn(Option<&Checkpoint>) -> Result<Option<Checkpoint>>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let existing = self.fetch(table).await?;
            let Some(next) = transition(existing.as_ref())? else {
                return Ok(existing);
            };
            if self
                .compare_and_set(&next, existing.as_ref().map(|c| c.sequence))
                .await?
            {
                return Ok(Some(next));
            }
            debug!(table = %table, "checkpoint changed concurrently, retrying");
        }
        Err(cas_exhausted(table))
    }
}

#[cfg(feature = "postgres")]
fn cas_exhausted(table: &TableId) -> Error {
    Error::checkpoint_write(
        table.to_string(),
        format!("lost {} consecutive compare-and-set races", CAS_ATTEMPTS),
    )
}

#[cfg(feature = "postgres")]
#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn commit(
        &self,
        table: &TableId,
        column: &str,
        watermark: &Value,
    ) -> Result<CommitOutcome> {
        for _ in 0..CAS_ATTEMPTS {
            let existing = self.fetch(table).await?;
            let outcome = apply_commit(existing.as_ref(), table, column, watermark, Utc::now())?;
            let CommitOutcome::Committed(next) = &outcome else {
                return Ok(outcome);
            };
            if self
                .compare_and_set(next, existing.as_ref().map(|c| c.sequence))
                .await?
            {
                return Ok(outcome);
            }
            debug!(table = %table, "checkpoint changed concurrently, retrying commit");
        }
        Err(cas_exhausted(table))
    }

    async fn load(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        self.fetch(table).await
    }

    async fn invalidate(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        self.update(table, |existing| {
            Ok(existing.and_then(|cp| apply_invalidate(cp, Utc::now())))
        })
        .await
    }

    async fn mark_orphaned(
        &self,
        table: &TableId,
        fingerprint: &str,
    ) -> Result<Option<Checkpoint>> {
        self.update(table, |existing| {
            Ok(existing.and_then(|cp| apply_orphan(cp, fingerprint, Utc::now())))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let query = format!(
            "SELECT checkpoint FROM {} ORDER BY table_id",
            self.table_name
        );
        let rows = self
            .client
            .query(&query, &[])
            .await
            .map_err(|e| Error::source_unavailable_with("failed to list checkpoints", e))?;
        let mut all = rows
            .iter()
            .map(|r| {
                let json: serde_json::Value = r.get(0);
                serde_json::from_value::<Checkpoint>(json).map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;
        all.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(all)
    }
}
