//! Schema differ
//!
//! Pure comparison of two snapshots. Output order follows table identity and
//! column order, so the same inputs always produce the same delta.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::schema::{ColumnDescriptor, SchemaSnapshot, TableDescriptor, TableId};
use crate::types::LogicalType;

/// Difference between a previous and a current snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchemaDelta {
    /// Tables present only in the current snapshot
    pub added: Vec<TableDescriptor>,
    /// Tables present only in the previous snapshot (previous descriptor)
    pub removed: Vec<TableDescriptor>,
    /// Tables present in both whose structure changed
    pub altered: Vec<TableAlteration>,
}

/// Structural change to one table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableAlteration {
    /// Table identity
    pub table: TableId,
    /// Individual changes in column order
    pub changes: Vec<ColumnChange>,
    /// Whether existing checkpoints for this table can no longer be trusted
    pub requires_full_reload: bool,
    /// Human-readable reason when a full reload is required
    pub reload_reason: Option<String>,
}

/// A single structural change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnChange {
    /// New column
    Added {
        /// Column name
        column: String,
        /// Vendor type
        native_type: String,
    },
    /// Column no longer present
    Removed {
        /// Column name
        column: String,
    },
    /// Column type changed
    Retyped {
        /// Column name
        column: String,
        /// Previous vendor type
        from: String,
        /// Current vendor type
        to: String,
        /// Previous logical type
        from_logical: LogicalType,
        /// Current logical type
        to_logical: LogicalType,
    },
    /// Column nullability changed
    NullabilityChanged {
        /// Column name
        column: String,
        /// Current nullability
        nullable: bool,
    },
    /// Primary key column list changed
    PrimaryKeyChanged {
        /// Previous key columns
        from: Vec<String>,
        /// Current key columns
        to: Vec<String>,
    },
    /// Incremental key column changed
    IncrementalKeyChanged {
        /// Previous key column
        from: Option<String>,
        /// Current key column
        to: Option<String>,
    },
}

impl SchemaDelta {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.altered.is_empty()
    }

    /// Whether `table` was added
    pub fn is_added(&self, table: &TableId) -> bool {
        self.added.iter().any(|t| &t.id == table)
    }

    /// Alteration record for `table`, if it changed
    pub fn alteration(&self, table: &TableId) -> Option<&TableAlteration> {
        self.altered.iter().find(|a| &a.table == table)
    }

    /// Whether `table` changed in a way that invalidates its checkpoint
    pub fn requires_full_reload(&self, table: &TableId) -> bool {
        self.alteration(table)
            .is_some_and(|a| a.requires_full_reload)
    }
}

/// Compare two snapshots
pub fn diff(previous: &SchemaSnapshot, current: &SchemaSnapshot) -> SchemaDelta {
    let prev: BTreeMap<&TableId, &TableDescriptor> =
        previous.tables().iter().map(|t| (&t.id, t)).collect();
    let curr: BTreeMap<&TableId, &TableDescriptor> =
        current.tables().iter().map(|t| (&t.id, t)).collect();

    let mut delta = SchemaDelta::default();

    for (id, table) in &curr {
        match prev.get(id) {
            None => delta.added.push((*table).clone()),
            Some(before) => {
                if let Some(alteration) = diff_table(before, table) {
                    delta.altered.push(alteration);
                }
            }
        }
    }
    for (id, table) in &prev {
        if !curr.contains_key(id) {
            delta.removed.push((*table).clone());
        }
    }

    delta
}

fn diff_table(before: &TableDescriptor, after: &TableDescriptor) -> Option<TableAlteration> {
    let mut changes = Vec::new();

    for old in &before.columns {
        match after.column(&old.name) {
            None => changes.push(ColumnChange::Removed {
                column: old.name.clone(),
            }),
            Some(new) => {
                if is_retyped(old, new) {
                    changes.push(ColumnChange::Retyped {
                        column: old.name.clone(),
                        from: old.native_type.clone(),
                        to: new.native_type.clone(),
                        from_logical: old.logical_type,
                        to_logical: new.logical_type,
                    });
                }
                if old.nullable != new.nullable {
                    changes.push(ColumnChange::NullabilityChanged {
                        column: old.name.clone(),
                        nullable: new.nullable,
                    });
                }
            }
        }
    }
    for new in &after.columns {
        if before.column(&new.name).is_none() {
            changes.push(ColumnChange::Added {
                column: new.name.clone(),
                native_type: new.native_type.clone(),
            });
        }
    }

    let mut reload_reason = None;

    if before.primary_key != after.primary_key {
        changes.push(ColumnChange::PrimaryKeyChanged {
            from: before.primary_key.clone(),
            to: after.primary_key.clone(),
        });
        reload_reason = Some("primary key changed".to_string());
    }

    if before.incremental_key != after.incremental_key {
        changes.push(ColumnChange::IncrementalKeyChanged {
            from: before.incremental_key.clone(),
            to: after.incremental_key.clone(),
        });
    }

    if reload_reason.is_none() {
        reload_reason = incremental_key_reload_reason(before, after);
    }

    if changes.is_empty() {
        return None;
    }
    Some(TableAlteration {
        table: after.id.clone(),
        changes,
        requires_full_reload: reload_reason.is_some(),
        reload_reason,
    })
}

fn is_retyped(old: &ColumnDescriptor, new: &ColumnDescriptor) -> bool {
    old.logical_type != new.logical_type
        || !old.native_type.eq_ignore_ascii_case(&new.native_type)
}

/// Why the previous incremental key can no longer be trusted, if it can't
fn incremental_key_reload_reason(
    before: &TableDescriptor,
    after: &TableDescriptor,
) -> Option<String> {
    let old_key = before.incremental_key.as_deref()?;
    match after.incremental_key.as_deref() {
        None => Some(format!("incremental key {} removed", old_key)),
        Some(new_key) if new_key != old_key => Some(format!(
            "incremental key changed from {} to {}",
            old_key, new_key
        )),
        Some(_) => {
            let old_col = before.column(old_key)?;
            let new_col = after.column(old_key)?;
            if old_col.logical_type.widens_to(new_col.logical_type) {
                None
            } else {
                Some(format!(
                    "incremental key {} retyped from {} to {}",
                    old_key, old_col.logical_type, new_col.logical_type
                ))
            }
        }
    }
}
