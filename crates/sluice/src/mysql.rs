//! MySQL backend for sluice
//!
//! `mysql_async` result sets borrow the connection, so streaming runs the
//! query on a task that holds the connection lock and forwards rows through a
//! bounded channel. Other calls on the same connection wait until the result
//! set is drained or the consumer goes away.

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use rust_decimal::Decimal;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Driver, RowStream};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Rows buffered between the reader task and the consumer
const STREAM_BUFFER: usize = 256;

/// `binary` collation id; text types with it are raw bytes
const BINARY_CHARSET: u16 = 63;

/// Convert a Value to a MySQL parameter
fn value_to_sql(value: &Value) -> mysql_async::Value {
    match value {
        Value::Null => mysql_async::Value::NULL,
        Value::Bool(b) => mysql_async::Value::from(*b),
        Value::Int8(n) => mysql_async::Value::from(*n),
        Value::Int16(n) => mysql_async::Value::from(*n),
        Value::Int32(n) => mysql_async::Value::from(*n),
        Value::Int64(n) => mysql_async::Value::from(*n),
        Value::Float32(n) => mysql_async::Value::from(*n),
        Value::Float64(n) => mysql_async::Value::from(*n),
        Value::Decimal(d) => mysql_async::Value::from(d.to_string()),
        Value::String(s) => mysql_async::Value::from(s.clone()),
        Value::Bytes(b) => mysql_async::Value::from(b.clone()),
        Value::Date(d) => {
            mysql_async::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql_async::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1000,
        ),
        Value::DateTime(dt) => datetime_to_sql(dt),
        Value::DateTimeTz(dt) => datetime_to_sql(&dt.naive_utc()),
        Value::Uuid(u) => mysql_async::Value::from(u.to_string()),
        Value::Json(j) => mysql_async::Value::from(j.to_string()),
        Value::Array(arr) => mysql_async::Value::from(
            serde_json::Value::Array(arr.iter().map(Value::to_json).collect()).to_string(),
        ),
    }
}

fn datetime_to_sql(dt: &chrono::NaiveDateTime) -> mysql_async::Value {
    let (date, time) = (dt.date(), dt.time());
    mysql_async::Value::Date(
        date.year() as u16,
        date.month() as u8,
        date.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
        time.nanosecond() / 1000,
    )
}

/// Convert a MySQL value to a Value, using the column type to refine text results
fn mysql_value_to_value(val: mysql_async::Value, column: &mysql_async::Column) -> Value {
    match val {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => bytes_to_value(b, column),
        mysql_async::Value::Int(n) => Value::Int64(n),
        mysql_async::Value::UInt(n) => match i64::try_from(n) {
            Ok(n) => Value::Int64(n),
            Err(_) => Value::Decimal(Decimal::from(n)),
        },
        mysql_async::Value::Float(f) => Value::Float32(f),
        mysql_async::Value::Double(d) => Value::Float64(d),
        mysql_async::Value::Date(year, month, day, hour, min, sec, micro) => {
            let Some(date) = chrono::NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            else {
                // zero dates ('0000-00-00') have no calendar equivalent
                return Value::Null;
            };
            if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                return Value::Date(date);
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(|time| Value::DateTime(chrono::NaiveDateTime::new(date, time)))
                .unwrap_or(Value::Null)
        }
        mysql_async::Value::Time(neg, days, hour, min, sec, micro) => {
            if neg || days > 0 {
                // outside time-of-day range; keep the textual form
                let sign = if neg { "-" } else { "" };
                let hours = days * 24 + u32::from(hour);
                return Value::String(format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, hours, min, sec, micro
                ));
            }
            chrono::NaiveTime::from_hms_micro_opt(hour as u32, min as u32, sec as u32, micro)
                .map(Value::Time)
                .unwrap_or(Value::Null)
        }
    }
}

fn bytes_to_value(bytes: Vec<u8>, column: &mysql_async::Column) -> Value {
    match column.column_type() {
        ColumnType::MYSQL_TYPE_NEWDECIMAL | ColumnType::MYSQL_TYPE_DECIMAL => {
            match std::str::from_utf8(&bytes).ok().and_then(|s| Decimal::from_str(s).ok()) {
                Some(d) => Value::Decimal(d),
                None => Value::Bytes(bytes),
            }
        }
        ColumnType::MYSQL_TYPE_JSON => match serde_json::from_slice(&bytes) {
            Ok(j) => Value::Json(j),
            Err(_) => Value::Bytes(bytes),
        },
        _ if column.character_set() == BINARY_CHARSET => Value::Bytes(bytes),
        _ => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        },
    }
}

fn mysql_row_to_row(mut row: mysql_async::Row) -> Row {
    let columns_ref = row.columns();
    let columns: Vec<String> = columns_ref
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values: Vec<Value> = columns_ref
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let val: mysql_async::Value = row.take(i).unwrap_or(mysql_async::Value::NULL);
            mysql_value_to_value(val, col)
        })
        .collect();
    Row::new(columns, values)
}

fn map_mysql_error(e: mysql_async::Error, sql: &str) -> Error {
    match e {
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => {
            Error::source_unavailable_with("mysql connection failed", e)
        }
        other => Error::query_with_sql(other.to_string(), sql),
    }
}

/// MySQL connection
pub struct MySqlConnection {
    conn: Arc<Mutex<Option<Conn>>>,
    database: String,
}

impl MySqlConnection {
    /// Wrap an established connection
    pub fn new(conn: Conn, database: String) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            database,
        }
    }

    /// Database this connection is bound to
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Take the inner connection; waits for any open stream to finish
    async fn take_conn(&self) -> Result<Conn> {
        self.conn
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::source_unavailable("mysql connection was lost"))
    }

    async fn put_conn(&self, conn: Conn) {
        *self.conn.lock().await = Some(conn);
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.take_conn().await?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let result: std::result::Result<Vec<mysql_async::Row>, _> =
            conn.exec(sql, mysql_params).await;
        self.put_conn(conn).await;
        let rows = result.map_err(|e| map_mysql_error(e, sql))?;
        Ok(rows.into_iter().map(mysql_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.take_conn().await?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let result = conn.exec_drop(sql, mysql_params).await;
        let affected = conn.affected_rows();
        self.put_conn(conn).await;
        result.map_err(|e| map_mysql_error(e, sql))?;
        Ok(affected)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        // the guard travels with the reader task so other calls wait for the stream
        let mut guard = self.conn.clone().lock_owned().await;
        let mut conn = guard
            .take()
            .ok_or_else(|| Error::source_unavailable("mysql connection was lost"))?;
        let mysql_params: Vec<mysql_async::Value> = params.iter().map(value_to_sql).collect();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sql = sql.to_string();

        tokio::spawn(async move {
            if forward_rows(&mut conn, &sql, mysql_params, tx).await {
                *guard = Some(conn);
            }
        });

        Ok(Box::pin(MySqlRowStream { rx }))
    }

    async fn is_valid(&self) -> bool {
        match self.conn.lock().await.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect()
                .await
                .map_err(|e| Error::internal(format!("failed to close mysql connection: {}", e)))?;
        }
        Ok(())
    }
}

/// Run `sql` and forward rows to `tx`; returns whether the connection is still usable
async fn forward_rows(
    conn: &mut Conn,
    sql: &str,
    params: Vec<mysql_async::Value>,
    tx: mpsc::Sender<Result<Row>>,
) -> bool {
    let mut result = match conn.exec_iter(sql, params).await {
        Ok(result) => result,
        Err(e) => {
            let _ = tx.send(Err(map_mysql_error(e, sql))).await;
            return true;
        }
    };

    loop {
        match result.next().await {
            Ok(Some(row)) => {
                if tx.send(Ok(mysql_row_to_row(row))).await.is_err() {
                    debug!("mysql stream consumer went away, draining result set");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(map_mysql_error(e, sql))).await;
                // a broken result set leaves the protocol in an unknown state
                return false;
            }
        }
    }

    if let Err(e) = result.drop_result().await {
        warn!(error = %e, "failed to drain mysql result set");
        return false;
    }
    true
}

struct MySqlRowStream {
    rx: mpsc::Receiver<Result<Row>>,
}

impl RowStream for MySqlRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move { self.rx.recv().await.transpose() })
    }
}

/// MySQL connection factory
#[derive(Debug, Clone, Default)]
pub struct MySqlConnectionFactory;

#[async_trait]
impl ConnectionFactory for MySqlConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let password = config.credential_source.resolve().await?;
        let url = config.to_url(password.as_ref())?;
        let opts = Opts::from_url(url.as_str())
            .map_err(|e| Error::config(format!("invalid mysql connection options: {}", e)))?;
        let opts = OptsBuilder::from_opts(opts).stmt_cache_size(Some(32));

        let conn = tokio::time::timeout(
            Duration::from_millis(config.connect_timeout_ms),
            Conn::new(opts),
        )
        .await
        .map_err(|_| {
            Error::source_unavailable(format!(
                "timed out connecting to {}",
                config.redacted_target()
            ))
        })?
        .map_err(|e| {
            Error::source_unavailable_with(
                format!("failed to connect to {}", config.redacted_target()),
                e,
            )
        })?;

        debug!(target = %config.redacted_target(), "mysql connection established");
        Ok(Box::new(MySqlConnection::new(conn, config.database.clone())))
    }

    fn driver(&self) -> Driver {
        Driver::MySql
    }
}
