//! In-memory source used by the integration tests
//!
//! `MockSource` holds tables and rows; the connection answers the SELECTs the
//! extractor generates (filter on `"key" > $1`, `ORDER BY "key"`), and the
//! schema provider reports the table shapes. A lower bound must have the same
//! `Value` variant as the stored key values.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use sluice::prelude::*;
use sluice::connection::VecRowStream;

#[derive(Default)]
struct SourceState {
    tables: BTreeMap<TableId, MockTable>,
    failing: HashSet<TableId>,
    failed_connects: u32,
    catalog_broken: bool,
    fetch_delay: Option<Duration>,
    queries: Vec<(String, Vec<Value>)>,
}

/// A table held by the mock source
#[derive(Clone)]
pub struct MockTable {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Row>,
    pub estimated_rows: Option<u64>,
}

/// Shared, mutable in-memory database
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<RwLock<SourceState>>,
    open_streams: Arc<AtomicUsize>,
    max_open_streams: Arc<AtomicUsize>,
}

pub fn tid(name: &str) -> TableId {
    TableId::new(Some("public"), name)
}

pub fn serial_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "bigint")
            .primary_key(1)
            .auto_increment(),
        ColumnDescriptor::new("payload", "text"),
    ]
}

pub fn serial_row(id: i64) -> Row {
    Row::new(
        vec!["id".into(), "payload".into()],
        vec![Value::Int64(id), Value::String(format!("row-{}", id))],
    )
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `public.<name>` with `id bigint` serial key and rows `ids`
    pub fn add_serial_table(&self, name: &str, ids: impl IntoIterator<Item = i64>) {
        let rows = ids.into_iter().map(serial_row).collect();
        self.add_table(name, serial_columns(), rows);
    }

    pub fn add_table(&self, name: &str, columns: Vec<ColumnDescriptor>, rows: Vec<Row>) {
        self.state.write().tables.insert(
            tid(name),
            MockTable {
                columns,
                rows,
                estimated_rows: None,
            },
        );
    }

    pub fn insert_rows(&self, name: &str, ids: impl IntoIterator<Item = i64>) {
        let mut state = self.state.write();
        if let Some(table) = state.tables.get_mut(&tid(name)) {
            table.rows.extend(ids.into_iter().map(serial_row));
        }
    }

    pub fn set_columns(&self, name: &str, columns: Vec<ColumnDescriptor>) {
        let mut state = self.state.write();
        if let Some(table) = state.tables.get_mut(&tid(name)) {
            table.columns = columns;
        }
    }

    pub fn set_estimate(&self, name: &str, rows: Option<u64>) {
        let mut state = self.state.write();
        if let Some(table) = state.tables.get_mut(&tid(name)) {
            table.estimated_rows = rows;
        }
    }

    pub fn drop_table(&self, name: &str) -> Option<MockTable> {
        self.state.write().tables.remove(&tid(name))
    }

    pub fn restore_table(&self, name: &str, table: MockTable) {
        self.state.write().tables.insert(tid(name), table);
    }

    /// Every extraction query against `name` fails
    pub fn fail_queries(&self, name: &str) {
        self.state.write().failing.insert(tid(name));
    }

    /// The next `n` connection attempts fail as unavailable
    pub fn fail_connects(&self, n: u32) {
        self.state.write().failed_connects = n;
    }

    pub fn break_catalog(&self, broken: bool) {
        self.state.write().catalog_broken = broken;
    }

    /// Hold each extraction query open for `delay` before rows are returned
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.write().fetch_delay = Some(delay);
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.read().queries.clone()
    }

    pub fn queries_for(&self, name: &str) -> Vec<(String, Vec<Value>)> {
        let quoted = quoted(&tid(name));
        self.queries()
            .into_iter()
            .filter(|(sql, _)| sql.contains(&quoted))
            .collect()
    }

    /// Highest number of extraction queries that were in flight at once
    pub fn max_concurrent_queries(&self) -> usize {
        self.max_open_streams.load(AtomicOrdering::SeqCst)
    }

    pub fn connection(&self) -> MockConnection {
        MockConnection {
            source: self.clone(),
        }
    }

    fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut state = self.state.write();
        state.queries.push((sql.to_string(), params.to_vec()));

        let (id, table) = state
            .tables
            .iter()
            .find(|(id, _)| sql.contains(&format!("FROM {}", quoted(id))))
            .ok_or_else(|| Error::query_with_sql("relation does not exist", sql))?;
        if state.failing.contains(id) {
            return Err(Error::query_with_sql("canceling statement due to lock timeout", sql));
        }

        let mut rows = table.rows.clone();
        if let (Some(column), Some(lower)) = (between(sql, "WHERE \"", "\" >"), params.first()) {
            // parameters bind by the column's type, as a typed driver does
            let stored = rows
                .iter()
                .filter_map(|r| r.get_by_name(column))
                .find(|v| !v.is_null());
            if let Some(stored) = stored {
                if std::mem::discriminant(stored) != std::mem::discriminant(lower) {
                    return Err(Error::query_with_sql(
                        format!("cannot bind {:?} to column {} holding {:?}", lower, column, stored),
                        sql,
                    ));
                }
            }
            rows.retain(|row| {
                row.get_by_name(column)
                    .and_then(|v| compare_watermarks(v, lower))
                    == Some(Ordering::Greater)
            });
        }
        if let Some(column) = between(sql, "ORDER BY \"", "\"") {
            rows.sort_by(|a, b| match (a.get_by_name(column), b.get_by_name(column)) {
                (Some(x), Some(y)) => compare_watermarks(x, y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
        }
        Ok(rows)
    }
}

fn quoted(id: &TableId) -> String {
    format!("\"{}\".\"{}\"", id.schema.as_deref().unwrap_or("public"), id.name)
}

fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let len = s[from..].find(end)?;
    Some(&s[from..from + len])
}

/// Connection over a [`MockSource`]
pub struct MockConnection {
    source: MockSource,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.source.select(sql, params)
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> Result<u64> {
        Ok(0)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let open = self.source.open_streams.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        self.source
            .max_open_streams
            .fetch_max(open, AtomicOrdering::SeqCst);

        let delay = self.source.state.read().fetch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let rows = self.source.select(sql, params);
        self.source.open_streams.fetch_sub(1, AtomicOrdering::SeqCst);
        Ok(Box::pin(VecRowStream::new(rows?)))
    }

    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory handing out [`MockConnection`]s
pub struct MockConnectionFactory {
    source: MockSource,
}

impl MockConnectionFactory {
    pub fn new(source: &MockSource) -> Self {
        Self {
            source: source.clone(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut state = self.source.state.write();
        if state.failed_connects > 0 {
            state.failed_connects -= 1;
            return Err(Error::source_unavailable(format!(
                "connection refused: {}",
                config.redacted_target()
            )));
        }
        Ok(Box::new(self.source.connection()))
    }

    fn driver(&self) -> Driver {
        Driver::Postgres
    }
}

/// Schema provider reporting the mock tables
pub struct MockSchemaProvider {
    source: MockSource,
}

impl MockSchemaProvider {
    pub fn new(source: &MockSource) -> Self {
        Self {
            source: source.clone(),
        }
    }
}

#[async_trait]
impl SchemaProvider for MockSchemaProvider {
    async fn list_tables(
        &self,
        _conn: &dyn Connection,
        include_schemas: &[String],
    ) -> Result<Vec<TableId>> {
        Ok(self
            .source
            .state
            .read()
            .tables
            .keys()
            .filter(|id| {
                include_schemas.is_empty()
                    || id
                        .schema
                        .as_ref()
                        .is_some_and(|s| include_schemas.contains(s))
            })
            .cloned()
            .collect())
    }

    async fn list_columns(
        &self,
        _conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Vec<ColumnDescriptor>> {
        let state = self.source.state.read();
        if state.catalog_broken {
            return Err(Error::query("permission denied for information_schema"));
        }
        Ok(state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn list_indexes(
        &self,
        _conn: &dyn Connection,
        _table: &TableId,
    ) -> Result<Vec<IndexDescriptor>> {
        Ok(Vec::new())
    }

    async fn estimate_rows(&self, _conn: &dyn Connection, table: &TableId) -> Result<Option<u64>> {
        Ok(self
            .source
            .state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.estimated_rows.or(Some(t.rows.len() as u64))))
    }
}

pub fn connection_config(pool_size: usize) -> ConnectionConfig {
    ConnectionConfig::new(Driver::Postgres, "mock", "shop", "etl").with_max_pool_size(pool_size)
}

pub async fn mock_pool(source: &MockSource, connection: ConnectionConfig) -> ConnectionPool {
    ConnectionPool::new(
        PoolConfig::from_connection(connection),
        Arc::new(MockConnectionFactory::new(source)),
    )
    .await
    .unwrap()
}

/// Stores and sink of one test deployment; reused across runs
pub struct Harness {
    pub source: MockSource,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub snapshots: Arc<MemorySnapshotStore>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new(source: &MockSource) -> Self {
        Self::with_sink(source, MemorySink::new())
    }

    pub fn with_sink(source: &MockSource, sink: MemorySink) -> Self {
        Self {
            source: source.clone(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            snapshots: Arc::new(MemorySnapshotStore::new()),
            sink: Arc::new(sink),
        }
    }

    pub async fn engine(&self, config: ExtractionConfig) -> Engine {
        self.engine_with(connection_config(4), config).await
    }

    pub async fn engine_with(&self, connection: ConnectionConfig, config: ExtractionConfig) -> Engine {
        Engine::new(
            mock_pool(&self.source, connection).await,
            Arc::new(MockSchemaProvider::new(&self.source)),
            Arc::new(PostgresDialect),
            self.checkpoints.clone(),
            self.snapshots.clone(),
            self.sink.clone(),
            config,
        )
    }

    pub async fn watermark(&self, name: &str) -> Option<Value> {
        self.checkpoints
            .load(&tid(name))
            .await
            .unwrap()
            .map(|cp| cp.watermark)
    }

    pub fn delivered_ids(&self, name: &str) -> Vec<i64> {
        self.sink
            .rows_for(&tid(name))
            .iter()
            .filter_map(|r| r.get_by_name("id").and_then(Value::as_i64))
            .collect()
    }
}
