//! Extraction planner
//!
//! Decides per table whether this run extracts everything (FULL) or only rows
//! past the stored watermark (INCREMENTAL), and which checkpoints must be
//! invalidated or orphaned before extraction starts.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, CheckpointStatus};
use crate::config::ExtractionConfig;
use crate::differ::SchemaDelta;
use crate::schema::{SchemaSnapshot, TableDescriptor, TableId};
use crate::types::Value;

/// How a table is extracted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    /// Every row
    Full,
    /// Rows with key greater than the lower bound
    Incremental,
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "FULL"),
            Self::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

/// Why a task got its mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlanReason {
    /// Table is new since the previous snapshot
    NewTable,
    /// Re-added table matches its orphaned checkpoint
    OrphanResumed,
    /// Structural change made the checkpoint untrustworthy
    SchemaChanged(String),
    /// Table is configured for full reload
    ConfiguredFullReload,
    /// Table has no incremental key
    NoIncrementalKey,
    /// Table has a key but no usable checkpoint
    NoCheckpoint,
    /// Resuming from an active checkpoint
    Resume,
}

impl fmt::Display for PlanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewTable => write!(f, "new table"),
            Self::OrphanResumed => write!(f, "re-added table resumes orphaned checkpoint"),
            Self::SchemaChanged(why) => write!(f, "schema changed: {}", why),
            Self::ConfiguredFullReload => write!(f, "configured for full reload"),
            Self::NoIncrementalKey => write!(f, "no incremental key"),
            Self::NoCheckpoint => write!(f, "no usable checkpoint"),
            Self::Resume => write!(f, "resume from checkpoint"),
        }
    }
}

/// One table's work for this run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionTask {
    /// Table to extract
    pub table: TableDescriptor,
    /// Extraction mode
    pub mode: ExtractionMode,
    /// Exclusive lower bound on the key (INCREMENTAL only)
    pub lower_bound: Option<Value>,
    /// Column whose values are committed as the watermark, if any
    pub watermark_column: Option<String>,
    /// Why this mode was chosen
    pub reason: PlanReason,
}

impl ExtractionTask {
    /// Table identity
    pub fn table_id(&self) -> &TableId {
        &self.table.id
    }

    /// Catalog row estimate
    pub fn estimated_rows(&self) -> Option<u64> {
        self.table.estimated_rows
    }
}

/// The work for one run, plus the checkpoint transitions it needs
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionPlan {
    /// Tasks in execution order
    pub tasks: Vec<ExtractionTask>,
    /// Checkpoints to invalidate before extraction
    pub invalidate: Vec<TableId>,
    /// Checkpoints to mark orphaned, with the removed table's fingerprint
    pub orphan: Vec<(TableId, String)>,
}

impl ExtractionPlan {
    /// Task for `table`, if planned
    pub fn task(&self, table: &TableId) -> Option<&ExtractionTask> {
        self.tasks.iter().find(|t| t.table_id() == table)
    }
}

/// Build the plan for `snapshot`.
///
/// Tasks are ordered by ascending row estimate; tables without an estimate
/// come last, and ties are broken by table identity.
pub fn plan(
    snapshot: &SchemaSnapshot,
    delta: &SchemaDelta,
    checkpoints: &HashMap<TableId, Checkpoint>,
    config: &ExtractionConfig,
) -> ExtractionPlan {
    let mut out = ExtractionPlan::default();

    for table in snapshot.tables() {
        let checkpoint = checkpoints.get(&table.id);
        let key = table.incremental_key.clone();

        let full = |reason: PlanReason| ExtractionTask {
            table: table.clone(),
            mode: ExtractionMode::Full,
            lower_bound: None,
            watermark_column: key.clone(),
            reason,
        };
        let incremental = |cp: &Checkpoint, reason: PlanReason| ExtractionTask {
            table: table.clone(),
            mode: ExtractionMode::Incremental,
            lower_bound: Some(cp.watermark.clone()),
            watermark_column: Some(cp.watermark_column.clone()),
            reason,
        };

        let (task, invalidate) = if config.is_full_reload(&table.id) {
            let mut task = full(PlanReason::ConfiguredFullReload);
            task.watermark_column = None;
            (task, true)
        } else if delta.is_added(&table.id) {
            match checkpoint {
                Some(cp) if resumes_orphan(cp, table) => {
                    (incremental(cp, PlanReason::OrphanResumed), false)
                }
                _ => (full(PlanReason::NewTable), true),
            }
        } else if let Some(alteration) = delta
            .alteration(&table.id)
            .filter(|a| a.requires_full_reload)
        {
            let why = alteration
                .reload_reason
                .clone()
                .unwrap_or_else(|| "structure changed".to_string());
            (full(PlanReason::SchemaChanged(why)), true)
        } else if key.is_none() {
            (full(PlanReason::NoIncrementalKey), false)
        } else {
            match checkpoint {
                Some(cp) if key.as_deref().is_some_and(|k| cp.is_usable_for(k)) => {
                    (incremental(cp, PlanReason::Resume), false)
                }
                // an orphaned checkpoint must not cap the end-of-table commit
                Some(cp) => (
                    full(PlanReason::NoCheckpoint),
                    cp.status == CheckpointStatus::Orphaned,
                ),
                None => (full(PlanReason::NoCheckpoint), false),
            }
        };

        if invalidate && checkpoint.is_some_and(|cp| cp.status != CheckpointStatus::Invalidated) {
            out.invalidate.push(table.id.clone());
        }
        debug!(
            table = %table.id,
            mode = %task.mode,
            reason = %task.reason,
            lower_bound = ?task.lower_bound,
            "table planned"
        );
        out.tasks.push(task);
    }

    for removed in &delta.removed {
        if checkpoints
            .get(&removed.id)
            .is_some_and(|cp| cp.status != CheckpointStatus::Invalidated)
        {
            out.orphan
                .push((removed.id.clone(), removed.fingerprint()));
        }
    }

    out.tasks.sort_by(|a, b| {
        let ka = (a.estimated_rows().is_none(), a.estimated_rows());
        let kb = (b.estimated_rows().is_none(), b.estimated_rows());
        ka.cmp(&kb).then_with(|| a.table_id().cmp(b.table_id()))
    });

    info!(
        tasks = out.tasks.len(),
        full = out.tasks.iter().filter(|t| t.mode == ExtractionMode::Full).count(),
        incremental = out
            .tasks
            .iter()
            .filter(|t| t.mode == ExtractionMode::Incremental)
            .count(),
        invalidate = out.invalidate.len(),
        orphan = out.orphan.len(),
        "extraction planned"
    );
    out
}

fn resumes_orphan(cp: &Checkpoint, table: &TableDescriptor) -> bool {
    cp.status == CheckpointStatus::Orphaned
        && cp.fingerprint.as_deref() == Some(table.fingerprint().as_str())
        && table.incremental_key.as_deref() == Some(cp.watermark_column.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::apply_commit;
    use crate::differ::diff;
    use crate::schema::ColumnDescriptor;
    use chrono::Utc;

    fn table(name: &str, rows: Option<u64>) -> TableDescriptor {
        TableDescriptor::new(
            TableId::new(Some("public"), name),
            vec![ColumnDescriptor::new("id", "bigint")
                .primary_key(1)
                .auto_increment()],
        )
        .unwrap()
        .with_incremental_key("id")
        .unwrap()
        .with_estimated_rows(rows)
    }

    fn snapshot(tables: Vec<TableDescriptor>) -> SchemaSnapshot {
        SchemaSnapshot::new(tables, Utc::now()).unwrap()
    }

    fn active(table: &TableDescriptor, watermark: i64) -> Checkpoint {
        apply_commit(None, &table.id, "id", &Value::Int64(watermark), Utc::now())
            .unwrap()
            .into_checkpoint()
    }

    #[test]
    fn test_ordering_by_estimate_then_name() {
        let curr = snapshot(vec![
            table("big", Some(1_000)),
            table("unknown_b", None),
            table("small", Some(10)),
            table("unknown_a", None),
            table("also_small", Some(10)),
        ]);
        let delta = diff(&SchemaSnapshot::empty(), &curr);
        let p = plan(&curr, &delta, &HashMap::new(), &ExtractionConfig::default());
        let names: Vec<&str> = p.tasks.iter().map(|t| t.table.id.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["also_small", "small", "big", "unknown_a", "unknown_b"]
        );
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let t = table("orders", Some(5));
        let curr = snapshot(vec![t.clone()]);
        let delta = diff(&curr, &curr);
        let cps = HashMap::from([(t.id.clone(), active(&t, 100))]);

        let p = plan(&curr, &delta, &cps, &ExtractionConfig::default());
        let task = p.task(&t.id).unwrap();
        assert_eq!(task.mode, ExtractionMode::Incremental);
        assert_eq!(task.lower_bound, Some(Value::Int64(100)));
        assert!(p.invalidate.is_empty());
    }

    #[test]
    fn test_configured_full_reload_invalidates() {
        let t = table("orders", None);
        let curr = snapshot(vec![t.clone()]);
        let delta = diff(&curr, &curr);
        let cps = HashMap::from([(t.id.clone(), active(&t, 100))]);
        let config = ExtractionConfig::default().with_full_reload("orders");

        let p = plan(&curr, &delta, &cps, &config);
        let task = p.task(&t.id).unwrap();
        assert_eq!(task.mode, ExtractionMode::Full);
        assert_eq!(task.watermark_column, None);
        assert_eq!(p.invalidate, vec![t.id.clone()]);
    }

    #[test]
    fn test_removed_table_is_orphaned() {
        let t = table("gone", None);
        let prev = snapshot(vec![t.clone()]);
        let curr = snapshot(vec![]);
        let delta = diff(&prev, &curr);
        let cps = HashMap::from([(t.id.clone(), active(&t, 1))]);

        let p = plan(&curr, &delta, &cps, &ExtractionConfig::default());
        assert!(p.tasks.is_empty());
        assert_eq!(p.orphan, vec![(t.id.clone(), t.fingerprint())]);
    }
}
