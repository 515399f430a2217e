//! Checkpoints
//!
//! A checkpoint records the highest incremental-key value a table has
//! delivered. Watermarks only move forward; an invalidated checkpoint resets
//! the baseline and is planned as if absent.
//!
//! The state transitions live here as pure functions so every backend shares
//! them; a backend only supplies per-key locking and persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::schema::TableId;
use crate::types::{compare_watermarks, Value};

/// Lifecycle state of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Watermark is trusted for incremental extraction
    Active,
    /// Table disappeared from the source; watermark retained
    Orphaned,
    /// Watermark must not be used; next plan treats it as absent
    Invalidated,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Orphaned => write!(f, "orphaned"),
            Self::Invalidated => write!(f, "invalidated"),
        }
    }
}

/// Persisted extraction progress of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Table identity
    pub table: TableId,
    /// Highest delivered value of `watermark_column`
    pub watermark: Value,
    /// Column the watermark was read from
    pub watermark_column: String,
    /// Incremented on every successful mutation
    pub sequence: u64,
    /// Time of the last successful mutation
    pub last_updated_at: DateTime<Utc>,
    /// Lifecycle state
    pub status: CheckpointStatus,
    /// Table fingerprint recorded when the table was orphaned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Checkpoint {
    /// Whether the watermark can seed an incremental extraction on `column`
    pub fn is_usable_for(&self, column: &str) -> bool {
        self.status == CheckpointStatus::Active && self.watermark_column == column
    }
}

/// Result of a commit
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The watermark advanced (or was re-committed at the same value)
    Committed(Checkpoint),
    /// The watermark would have regressed; the stored checkpoint is unchanged
    Ignored(Checkpoint),
}

impl CommitOutcome {
    /// The checkpoint as stored after the commit
    pub fn checkpoint(&self) -> &Checkpoint {
        match self {
            Self::Committed(c) | Self::Ignored(c) => c,
        }
    }

    /// Whether the store was written
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    /// Take the stored checkpoint
    pub fn into_checkpoint(self) -> Checkpoint {
        match self {
            Self::Committed(c) | Self::Ignored(c) => c,
        }
    }
}

/// Compute the result of committing `watermark` over `existing`.
///
/// The watermark is accepted when nothing is stored, the stored checkpoint is
/// invalidated or tracks another column, or `watermark >= stored`. A value
/// that cannot be compared with the stored one is a `CheckpointWrite` error.
pub fn apply_commit(
    existing: Option<&Checkpoint>,
    table: &TableId,
    column: &str,
    watermark: &Value,
    now: DateTime<Utc>,
) -> Result<CommitOutcome> {
    if watermark.is_null() {
        return Err(Error::checkpoint_write(
            table.to_string(),
            "watermark cannot be NULL",
        ));
    }

    let sequence = match existing {
        None => 1,
        Some(prev) => {
            let comparable_baseline =
                prev.status != CheckpointStatus::Invalidated && prev.watermark_column == column;
            if comparable_baseline {
                match compare_watermarks(watermark, &prev.watermark) {
                    Some(Ordering::Less) => return Ok(CommitOutcome::Ignored(prev.clone())),
                    Some(_) => {}
                    None => {
                        return Err(Error::checkpoint_write(
                            table.to_string(),
                            format!(
                                "watermark {} ({}) is not comparable with stored {} ({})",
                                watermark,
                                watermark.sql_type(),
                                prev.watermark,
                                prev.watermark.sql_type()
                            ),
                        ))
                    }
                }
            }
            prev.sequence + 1
        }
    };

    Ok(CommitOutcome::Committed(Checkpoint {
        table: table.clone(),
        watermark: watermark.clone(),
        watermark_column: column.to_string(),
        sequence,
        last_updated_at: now,
        status: CheckpointStatus::Active,
        fingerprint: None,
    }))
}

/// Compute the invalidated form of `existing`; `None` when nothing changes
pub fn apply_invalidate(existing: &Checkpoint, now: DateTime<Utc>) -> Option<Checkpoint> {
    if existing.status == CheckpointStatus::Invalidated {
        return None;
    }
    Some(Checkpoint {
        sequence: existing.sequence + 1,
        last_updated_at: now,
        status: CheckpointStatus::Invalidated,
        fingerprint: None,
        ..existing.clone()
    })
}

/// Compute the orphaned form of `existing`; `None` when nothing changes.
///
/// Invalidated checkpoints stay invalidated.
pub fn apply_orphan(
    existing: &Checkpoint,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Option<Checkpoint> {
    match existing.status {
        CheckpointStatus::Invalidated => None,
        CheckpointStatus::Orphaned if existing.fingerprint.as_deref() == Some(fingerprint) => None,
        _ => Some(Checkpoint {
            sequence: existing.sequence + 1,
            last_updated_at: now,
            status: CheckpointStatus::Orphaned,
            fingerprint: Some(fingerprint.to_string()),
            ..existing.clone()
        }),
    }
}

/// Durable per-table checkpoint storage.
///
/// Operations on one table are mutually exclusive; different tables never
/// contend. Every operation is idempotent.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Advance the watermark of `table` (see [`apply_commit`])
    async fn commit(&self, table: &TableId, column: &str, watermark: &Value)
        -> Result<CommitOutcome>;

    /// Current checkpoint of `table`
    async fn load(&self, table: &TableId) -> Result<Option<Checkpoint>>;

    /// Mark the checkpoint of `table` invalidated; returns the stored state
    async fn invalidate(&self, table: &TableId) -> Result<Option<Checkpoint>>;

    /// Mark the checkpoint of `table` orphaned with the table's last fingerprint
    async fn mark_orphaned(&self, table: &TableId, fingerprint: &str)
        -> Result<Option<Checkpoint>>;

    /// All checkpoints, ordered by table identity
    async fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// In-memory checkpoint store
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<TableId, Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn commit(
        &self,
        table: &TableId,
        column: &str,
        watermark: &Value,
    ) -> Result<CommitOutcome> {
        // entry() holds the shard lock for the read-modify-write
        let entry = self.checkpoints.entry(table.clone());
        let existing = match &entry {
            Entry::Occupied(e) => Some(e.get()),
            Entry::Vacant(_) => None,
        };
        let outcome = apply_commit(existing, table, column, watermark, Utc::now())?;
        if let CommitOutcome::Committed(next) = &outcome {
            entry.insert(next.clone());
        }
        Ok(outcome)
    }

    async fn load(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(table).map(|c| c.clone()))
    }

    async fn invalidate(&self, table: &TableId) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get_mut(table).map(|mut current| {
            if let Some(next) = apply_invalidate(&current, Utc::now()) {
                *current = next;
            }
            current.clone()
        }))
    }

    async fn mark_orphaned(
        &self,
        table: &TableId,
        fingerprint: &str,
    ) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get_mut(table).map(|mut current| {
            if let Some(next) = apply_orphan(&current, fingerprint, Utc::now()) {
                *current = next;
            }
            current.clone()
        }))
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut all: Vec<Checkpoint> = self.checkpoints.iter().map(|c| c.clone()).collect();
        all.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(all)
    }
}
