//! Schema crawler
//!
//! Produces a `SchemaSnapshot` of every visible table, including a best-guess
//! incremental key per table. A crawl either returns a complete snapshot or
//! fails; partial results are discarded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::schema::{SchemaProvider, SchemaSnapshot, TableDescriptor, TableId};
use crate::types::LogicalType;

/// Column names treated as "last modified" timestamps, in preference order
const UPDATED_AT_NAMES: &[&str] = &[
    "updated_at",
    "updatedat",
    "modified_at",
    "last_modified",
    "last_modified_at",
    "update_time",
    "updated_ts",
    "updated",
    "modified",
];

/// Crawls catalog metadata into schema snapshots
pub struct SchemaCrawler {
    provider: Arc<dyn SchemaProvider>,
    config: Arc<ExtractionConfig>,
    last_captured: Mutex<Option<DateTime<Utc>>>,
}

impl SchemaCrawler {
    /// Create a crawler
    pub fn new(provider: Arc<dyn SchemaProvider>, config: Arc<ExtractionConfig>) -> Self {
        Self {
            provider,
            config,
            last_captured: Mutex::new(None),
        }
    }

    /// Introspect every visible table.
    ///
    /// Catalog failures surface as `Introspection` (or `SourceUnavailable`
    /// when the connection itself is gone); an incremental-key override that
    /// names a missing column is a `Configuration` error.
    pub async fn crawl(&self, conn: &dyn Connection) -> Result<SchemaSnapshot> {
        let ids = self
            .provider
            .list_tables(conn, &self.config.include_schemas)
            .await
            .map_err(|e| e.into_introspection("listing tables"))?;

        let mut tables = Vec::with_capacity(ids.len());
        for id in ids {
            if self.config.is_excluded(&id) || !self.config.includes_schema(id.schema.as_deref()) {
                debug!(table = %id, "table excluded from crawl");
                continue;
            }
            match self.describe(conn, id).await? {
                Some(table) => tables.push(table),
                None => continue,
            }
        }

        for name in self.config.incremental_key_overrides.keys() {
            if !tables.iter().any(|t| t.id.matches(name)) {
                warn!(table = %name, "incremental key override names a table that was not crawled");
            }
        }

        let snapshot = SchemaSnapshot::new(tables, self.next_capture_time())?;
        info!(
            tables = snapshot.len(),
            captured_at = %snapshot.captured_at(),
            "schema crawl complete"
        );
        Ok(snapshot)
    }

    async fn describe(&self, conn: &dyn Connection, id: TableId) -> Result<Option<TableDescriptor>> {
        let context = format!("describing {}", id);
        let columns = self
            .provider
            .list_columns(conn, &id)
            .await
            .map_err(|e| e.into_introspection(&context))?;
        if columns.is_empty() {
            // dropped between listing and describing
            warn!(table = %id, "table has no visible columns, skipping");
            return Ok(None);
        }
        let indexes = self
            .provider
            .list_indexes(conn, &id)
            .await
            .map_err(|e| e.into_introspection(&context))?;
        let estimated_rows = self
            .provider
            .estimate_rows(conn, &id)
            .await
            .map_err(|e| e.into_introspection(&context))?;

        let table = TableDescriptor::new(id, columns)?
            .with_indexes(indexes)
            .with_estimated_rows(estimated_rows);

        let key = choose_incremental_key(&table, self.config.key_override(&table.id))?;
        let table = match key {
            Some(column) => table.with_incremental_key(column)?,
            None => table,
        };
        debug!(
            table = %table.id,
            columns = table.columns.len(),
            incremental_key = table.incremental_key.as_deref().unwrap_or("-"),
            estimated_rows = ?table.estimated_rows,
            "table described"
        );
        Ok(Some(table))
    }

    /// Capture timestamps never go backwards for one crawler
    fn next_capture_time(&self) -> DateTime<Utc> {
        let mut last = self.last_captured.lock();
        let now = Utc::now();
        let at = match *last {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        *last = Some(at);
        at
    }
}

/// Pick the incremental key of `table`.
///
/// In order: the configured override, a single auto-increment integer primary
/// key, a single auto-increment integer column, then an `updated_at`-style
/// timestamp column. Returns `None` when nothing qualifies.
pub fn choose_incremental_key(
    table: &TableDescriptor,
    override_column: Option<&str>,
) -> Result<Option<String>> {
    if let Some(name) = override_column {
        let column = table.column(name).ok_or_else(|| {
            Error::config(format!(
                "incremental key override {} is not a column of {}",
                name, table.id
            ))
        })?;
        if !column.logical_type.is_orderable() {
            return Err(Error::config(format!(
                "incremental key override {}.{} has type {} which cannot be used as a watermark",
                table.id, name, column.native_type
            )));
        }
        return Ok(Some(column.name.clone()));
    }

    if let [pk] = table.primary_key.as_slice() {
        if let Some(col) = table.column(pk) {
            if col.logical_type == LogicalType::Integer && col.auto_increment {
                return Ok(Some(col.name.clone()));
            }
        }
    }

    let serials: Vec<_> = table
        .columns
        .iter()
        .filter(|c| c.logical_type == LogicalType::Integer && c.auto_increment)
        .collect();
    if let [only] = serials.as_slice() {
        return Ok(Some(only.name.clone()));
    }

    for candidate in UPDATED_AT_NAMES {
        if let Some(col) = table.columns.iter().find(|c| {
            c.name.eq_ignore_ascii_case(candidate) && c.logical_type == LogicalType::DateTime
        }) {
            return Ok(Some(col.name.clone()));
        }
    }

    Ok(None)
}
