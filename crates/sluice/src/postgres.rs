//! PostgreSQL backend for sluice
//!
//! - Parameter and row conversion between `Value` and tokio-postgres types
//! - `PgConnection` with server-side streaming through `query_raw`
//! - `PgConnectionFactory` resolving credentials at connect time

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Driver, RowStream};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type PgParam = Box<dyn ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres parameter
fn value_to_sql(value: &Value) -> PgParam {
    match value {
        Value::Null => Box::new(Option::<i32>::None),
        Value::Bool(b) => Box::new(*b),
        // PostgreSQL has no one-byte integer
        Value::Int8(n) => Box::new(i16::from(*n)),
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::Time(t) => Box::new(*t),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Uuid(u) => Box::new(*u),
        Value::Json(j) => Box::new(j.clone()),
        Value::Array(arr) => Box::new(serde_json::Value::Array(
            arr.iter().map(Value::to_json).collect(),
        )),
    }
}

fn boxed_params(params: &[Value]) -> Vec<PgParam> {
    params.iter().map(value_to_sql).collect()
}

fn param_refs(boxed: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<Value>>>()?;

    Ok(Row::new(columns, values))
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        let column = row.columns().get(idx).map(|c| c.name()).unwrap_or("?");
        Error::type_conversion(format!("cannot decode column {}: {}", column, e))
    })
}

/// Binary wire form of a value `Value` has no variant for
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Unmapped types: enum labels as text, everything else as raw bytes
fn raw_to_value(pg_type: &Type, raw: RawValue) -> Value {
    match pg_type.kind() {
        Kind::Enum(_) => Value::String(String::from_utf8_lossy(&raw.0).into_owned()),
        _ => Value::Bytes(raw.0),
    }
}

/// Convert a PostgreSQL value to a Value; a value that cannot be decoded is a
/// `TypeConversion` error
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    let value = match *pg_type {
        Type::BOOL => get(row, idx)?.map(Value::Bool),
        Type::INT2 => get(row, idx)?.map(Value::Int16),
        Type::INT4 => get(row, idx)?.map(Value::Int32),
        Type::INT8 => get(row, idx)?.map(Value::Int64),
        // oid columns show up in catalog queries
        Type::OID => get::<u32>(row, idx)?.map(|n| Value::Int64(i64::from(n))),
        Type::FLOAT4 => get(row, idx)?.map(Value::Float32),
        Type::FLOAT8 => get(row, idx)?.map(Value::Float64),
        Type::NUMERIC => get(row, idx)?.map(Value::Decimal),
        Type::BYTEA => get(row, idx)?.map(Value::Bytes),
        Type::DATE => get(row, idx)?.map(Value::Date),
        Type::TIME => get(row, idx)?.map(Value::Time),
        Type::TIMESTAMP => get(row, idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => get(row, idx)?.map(Value::DateTimeTz),
        Type::UUID => get(row, idx)?.map(Value::Uuid),
        Type::JSON | Type::JSONB => get(row, idx)?.map(Value::Json),
        _ if <String as FromSql>::accepts(pg_type) => get(row, idx)?.map(Value::String),
        _ => get::<RawValue>(row, idx)?.map(|raw| raw_to_value(pg_type, raw)),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::source_unavailable_with("postgres connection closed", e);
    }
    Error::query_with_sql(e.to_string(), sql)
}

/// PostgreSQL connection
pub struct PgConnection {
    client: tokio_postgres::Client,
    closed: AtomicBool,
}

impl PgConnection {
    /// Wrap a connected client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::source_unavailable("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let boxed = boxed_params(params);
        let pg_rows = self
            .client
            .query(sql, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let boxed = boxed_params(params);
        self.client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.ensure_open()?;
        let boxed = boxed_params(params);
        let refs = param_refs(&boxed);
        let stream = self
            .client
            .query_raw(sql, refs.iter().copied())
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        Ok(Box::pin(PgRowStream {
            inner: Box::pin(stream),
            sql: sql.to_string(),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Rows pulled from the server as the consumer asks for them
struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.next().await {
                None => Ok(None),
                Some(Ok(row)) => pg_row_to_row(&row).map(Some),
                Some(Err(e)) => Err(map_pg_error(e, &self.sql)),
            }
        })
    }
}

/// Open a raw tokio-postgres client for `config`.
///
/// The connection task is spawned onto the current runtime.
pub async fn connect_client(config: &ConnectionConfig) -> Result<tokio_postgres::Client> {
    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port())
        .dbname(&config.database)
        .user(&config.username)
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    if let Some(app) = &config.application_name {
        pg.application_name(app);
    }
    if let Some(password) = config.credential_source.resolve().await? {
        pg.password(password.expose_secret());
    }

    let (client, connection) = pg.connect(tokio_postgres::NoTls).await.map_err(|e| {
        Error::source_unavailable_with(
            format!("failed to connect to {}", config.redacted_target()),
            e,
        )
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "postgres connection terminated");
        }
    });
    debug!(target = %config.redacted_target(), "postgres connection established");
    Ok(client)
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let client = connect_client(config).await?;
        Ok(Box::new(PgConnection::new(client)))
    }

    fn driver(&self) -> Driver {
        Driver::Postgres
    }
}
