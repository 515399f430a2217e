//! Row extractor
//!
//! Turns one planned task into a lazy stream of fixed-size batches. Rows are
//! pulled from the server only as batches are consumed, so a slow sink stalls
//! the query instead of buffering the table in memory.

use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::planner::{ExtractionMode, ExtractionTask};
use crate::schema::TableId;
use crate::types::{coerce_watermark, compare_watermarks, Row, Value};

/// Consecutive rows of one table
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    /// Source table
    pub table: TableId,
    /// 1-based position of this batch in the table's stream
    pub sequence: u64,
    /// Rows in key order
    pub rows: Vec<Row>,
    /// Key of the last row (INCREMENTAL) or highest key so far (FULL)
    pub watermark: Option<Value>,
}

impl RecordBatch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Streams table rows in batches
#[derive(Clone)]
pub struct RowExtractor {
    dialect: Arc<dyn SqlDialect>,
    batch_size: usize,
    query_timeout: Duration,
}

impl RowExtractor {
    /// Create an extractor producing batches of `batch_size` rows
    pub fn new(dialect: Arc<dyn SqlDialect>, batch_size: usize, query_timeout: Duration) -> Self {
        Self {
            dialect,
            batch_size: batch_size.max(1),
            query_timeout,
        }
    }

    /// Rows per batch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// SQL and bound parameters for `task`.
    ///
    /// INCREMENTAL: `WHERE key > $1 ORDER BY key ASC`, with the lower bound
    /// converted to the key column's current type. FULL: no filter, ordered by
    /// primary key when the table has one.
    pub fn build_query(&self, task: &ExtractionTask) -> Result<(String, Vec<Value>)> {
        let table = &task.table;
        let columns = table.column_names();

        match task.mode {
            ExtractionMode::Incremental => {
                let (Some(key), Some(lower)) = (&task.watermark_column, &task.lower_bound) else {
                    return Err(Error::internal(format!(
                        "incremental task for {} has no key or lower bound",
                        table.id
                    )));
                };
                let filter = format!(
                    "{} > {}",
                    self.dialect.quote_identifier(key),
                    self.dialect.placeholder(1)
                );
                let sql = self.dialect.build_select(
                    table.id.schema.as_deref(),
                    &table.id.name,
                    &columns,
                    Some(&filter),
                    &[(key.as_str(), true)],
                    None,
                );
                // checkpoints taken before a widening retype hold the old type
                let lower = match table.column(key) {
                    Some(col) => coerce_watermark(lower, &col.native_type)?,
                    None => lower.clone(),
                };
                Ok((sql, vec![lower]))
            }
            ExtractionMode::Full => {
                let order: Vec<(&str, bool)> =
                    table.primary_key.iter().map(|c| (c.as_str(), true)).collect();
                let sql = self.dialect.build_select(
                    table.id.schema.as_deref(),
                    &table.id.name,
                    &columns,
                    None,
                    &order,
                    None,
                );
                Ok((sql, Vec::new()))
            }
        }
    }

    /// Stream `task` as batches.
    ///
    /// Every batch holds exactly `batch_size` rows except possibly the last; an
    /// empty table yields nothing. Errors end the stream and are reported as
    /// `Extraction` errors of the task's table.
    pub fn extract<'a>(
        &'a self,
        conn: &'a dyn Connection,
        task: &'a ExtractionTask,
    ) -> impl Stream<Item = Result<RecordBatch>> + Send + 'a {
        async_stream::stream! {
            let table = task.table_id().clone();
            let (sql, params) = match self.build_query(task) {
                Ok(q) => q,
                Err(e) => {
                    yield Err(Error::extraction(table, e));
                    return;
                }
            };
            debug!(table = %table, mode = %task.mode, sql = %sql, "starting extraction query");

            let mut rows = match self.bounded(conn.query_stream(&sql, &params), &table).await {
                Ok(rows) => rows,
                Err(e) => {
                    yield Err(Error::extraction(table, e));
                    return;
                }
            };

            let key = task.watermark_column.as_deref();
            let mut buffer: Vec<Row> = Vec::with_capacity(self.batch_size);
            let mut watermark: Option<Value> = None;
            let mut sequence = 0u64;

            loop {
                let next = match self.bounded(rows.next(), &table).await {
                    Ok(next) => next,
                    Err(e) => {
                        yield Err(Error::extraction(table, e));
                        return;
                    }
                };
                let Some(row) = next else { break };

                if let Some(value) = key.and_then(|k| row.get_by_name(k)) {
                    advance_watermark(&mut watermark, value, task.mode);
                }
                buffer.push(row);

                if buffer.len() == self.batch_size {
                    sequence += 1;
                    yield Ok(RecordBatch {
                        table: table.clone(),
                        sequence,
                        rows: std::mem::replace(&mut buffer, Vec::with_capacity(self.batch_size)),
                        watermark: watermark.clone(),
                    });
                }
            }

            if !buffer.is_empty() {
                sequence += 1;
                yield Ok(RecordBatch {
                    table: table.clone(),
                    sequence,
                    rows: buffer,
                    watermark,
                });
            }
            debug!(table = %table, batches = sequence, "extraction stream finished");
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
        table: &TableId,
    ) -> Result<T> {
        tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| {
                Error::timeout(format!(
                    "fetching rows of {} exceeded {}ms",
                    table,
                    self.query_timeout.as_millis()
                ))
            })?
    }
}

/// INCREMENTAL rows arrive in key order, so the last key wins; FULL keeps the maximum
fn advance_watermark(current: &mut Option<Value>, value: &Value, mode: ExtractionMode) {
    if value.is_null() {
        return;
    }
    let replace = match (mode, current.as_ref()) {
        (_, None) | (ExtractionMode::Incremental, Some(_)) => true,
        (ExtractionMode::Full, Some(cur)) => {
            compare_watermarks(value, cur) == Some(std::cmp::Ordering::Greater)
        }
    };
    if replace {
        *current = Some(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, PostgresDialect};
    use crate::planner::PlanReason;
    use crate::schema::{ColumnDescriptor, TableDescriptor};

    fn task(mode: ExtractionMode, lower: Option<i64>) -> ExtractionTask {
        let table = TableDescriptor::new(
            TableId::new(Some("public"), "events"),
            vec![
                ColumnDescriptor::new("id", "bigint").primary_key(1).auto_increment(),
                ColumnDescriptor::new("payload", "text"),
            ],
        )
        .unwrap()
        .with_incremental_key("id")
        .unwrap();
        ExtractionTask {
            table,
            mode,
            lower_bound: lower.map(Value::Int64),
            watermark_column: Some("id".into()),
            reason: PlanReason::Resume,
        }
    }

    #[test]
    fn test_incremental_query_postgres() {
        let x = RowExtractor::new(Arc::new(PostgresDialect), 10, Duration::from_secs(1));
        let (sql, params) = x.build_query(&task(ExtractionMode::Incremental, Some(100))).unwrap();
        assert!(sql.contains(r#"SELECT "id", "payload" FROM "public"."events""#));
        assert!(sql.contains(r#"WHERE "id" > $1"#));
        assert!(sql.ends_with(r#"ORDER BY "id" ASC"#));
        assert_eq!(params, vec![Value::Int64(100)]);
    }

    #[test]
    fn test_incremental_query_mysql() {
        let x = RowExtractor::new(Arc::new(MySqlDialect), 10, Duration::from_secs(1));
        let (sql, _) = x.build_query(&task(ExtractionMode::Incremental, Some(1))).unwrap();
        assert!(sql.contains("WHERE `id` > ?"));
    }

    #[test]
    fn test_lower_bound_follows_retyped_key() {
        let table = TableDescriptor::new(
            TableId::new(Some("public"), "events"),
            vec![ColumnDescriptor::new("updated_at", "timestamp with time zone")],
        )
        .unwrap()
        .with_incremental_key("updated_at")
        .unwrap();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let task = ExtractionTask {
            table,
            mode: ExtractionMode::Incremental,
            lower_bound: Some(Value::Date(day)),
            watermark_column: Some("updated_at".into()),
            reason: PlanReason::Resume,
        };

        let x = RowExtractor::new(Arc::new(PostgresDialect), 10, Duration::from_secs(1));
        let (_, params) = x.build_query(&task).unwrap();
        assert_eq!(
            params,
            vec![Value::DateTimeTz(day.and_hms_opt(0, 0, 0).unwrap().and_utc())]
        );
    }

    #[test]
    fn test_full_query_orders_by_primary_key() {
        let x = RowExtractor::new(Arc::new(PostgresDialect), 10, Duration::from_secs(1));
        let (sql, params) = x.build_query(&task(ExtractionMode::Full, None)).unwrap();
        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with(r#"ORDER BY "id" ASC"#));
        assert!(params.is_empty());
    }

    #[test]
    fn test_incremental_without_bound_is_rejected() {
        let x = RowExtractor::new(Arc::new(PostgresDialect), 10, Duration::from_secs(1));
        assert!(x.build_query(&task(ExtractionMode::Incremental, None)).is_err());
    }

    #[test]
    fn test_full_watermark_is_running_max() {
        let mut w = None;
        for v in [5, 9, 3] {
            advance_watermark(&mut w, &Value::Int64(v), ExtractionMode::Full);
        }
        advance_watermark(&mut w, &Value::Null, ExtractionMode::Full);
        assert_eq!(w, Some(Value::Int64(9)));
    }
}
