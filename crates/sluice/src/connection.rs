//! Connection traits and options for sluice
//!
//! Core abstractions for source connectivity:
//! - Connection: read-only query execution against the source
//! - RowStream: streaming row iteration for extraction
//! - ConnectionConfig: connection options, including where credentials come from
//! - Driver: the closed set of supported backends

use async_trait::async_trait;
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use validator::Validate;

use crate::dialect::{MySqlDialect, PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// A connection to the source database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query and stream results
    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>>;

    /// Execute a query and return the first row (convenience method)
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let rows = self.query(sql, params).await?;
        Ok(rows.into_iter().next())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Streaming row iterator
pub trait RowStream: Send + Unpin {
    /// Get the next row
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>>;
}

/// Row stream over rows that are already materialized
pub struct VecRowStream {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowStream {
    /// Create a stream yielding `rows` in order
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        let row = self.rows.next();
        Box::pin(async move { Ok(row) })
    }
}

/// A string that never shows up in logs, debug output or serialized config
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Use only where the actual value is needed (authentication).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Serialize as redacted to prevent accidental exposure in config dumps
impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
        }
        schema
    }
}

/// Where the connection password comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialSource {
    /// No password (trust / socket auth)
    #[default]
    None,
    /// Password given directly in configuration
    Inline {
        /// The password
        value: SensitiveString,
    },
    /// Password read from an environment variable at connect time
    Env {
        /// Variable name
        var: String,
    },
    /// Password read from a file at connect time (trailing newline stripped)
    File {
        /// Path to the secret file
        path: PathBuf,
    },
}

impl CredentialSource {
    /// Resolve the credential. `Ok(None)` means no password is configured.
    pub async fn resolve(&self) -> Result<Option<SensitiveString>> {
        match self {
            Self::None => Ok(None),
            Self::Inline { value } => Ok(Some(value.clone())),
            Self::Env { var } => std::env::var(var)
                .map(|v| Some(SensitiveString::new(v)))
                .map_err(|_| Error::config(format!("credential variable {} is not set", var))),
            Self::File { path } => {
                let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                    Error::config(format!(
                        "cannot read credential file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok(Some(SensitiveString::new(
                    content.trim_end_matches(['\r', '\n']),
                )))
            }
        }
    }
}

/// Supported source backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// PostgreSQL
    #[serde(alias = "postgresql", alias = "pg")]
    Postgres,
    /// MySQL / MariaDB
    #[serde(alias = "mariadb")]
    MySql,
}

impl Driver {
    /// Default TCP port for the backend
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql => 3306,
        }
    }

    /// SQL dialect for the backend
    pub fn dialect(self) -> Arc<dyn SqlDialect> {
        match self {
            Self::Postgres => Arc::new(PostgresDialect),
            Self::MySql => Arc::new(MySqlDialect),
        }
    }

    /// Connection factory for the backend.
    ///
    /// Fails with `Unsupported` when the backend was compiled out.
    pub fn connection_factory(self) -> Result<Arc<dyn ConnectionFactory>> {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres => Ok(Arc::new(crate::postgres::PgConnectionFactory)),
            #[cfg(feature = "mysql")]
            Self::MySql => Ok(Arc::new(crate::mysql::MySqlConnectionFactory)),
            #[allow(unreachable_patterns)]
            other => Err(Error::unsupported(format!(
                "{} support is not compiled in",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "PostgreSQL"),
            Self::MySql => write!(f, "MySQL"),
        }
    }
}

/// Options for connecting to the source database
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct ConnectionConfig {
    /// Backend driver
    pub driver: Driver,

    /// Server host name or address
    #[validate(length(min = 1))]
    pub host: String,

    /// Server port (defaults to the driver's standard port)
    #[serde(default)]
    pub port: Option<u16>,

    /// Database name
    #[validate(length(min = 1))]
    pub database: String,

    /// User name
    #[validate(length(min = 1))]
    pub username: String,

    /// Where the password comes from
    #[serde(default)]
    pub credential_source: CredentialSource,

    /// Maximum number of pooled connections
    #[serde(default = "default_max_pool_size")]
    #[validate(range(min = 1, max = 256))]
    pub max_pool_size: usize,

    /// Timeout for establishing a connection
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Timeout for each query round trip (0 = no timeout)
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Timeout for acquiring a pooled connection
    #[serde(default = "default_acquire_timeout_ms")]
    #[validate(range(min = 1))]
    pub acquire_timeout_ms: u64,

    /// Application name (shown in pg_stat_activity, etc)
    #[serde(default = "default_application_name")]
    pub application_name: Option<String>,
}

fn default_max_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_query_timeout_ms() -> u64 {
    300_000
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_application_name() -> Option<String> {
    Some("sluice".into())
}

impl ConnectionConfig {
    /// Create configuration with driver defaults
    pub fn new(
        driver: Driver,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            driver,
            host: host.into(),
            port: None,
            database: database.into(),
            username: username.into(),
            credential_source: CredentialSource::None,
            max_pool_size: default_max_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            application_name: default_application_name(),
        }
    }

    /// Effective port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.driver.default_port())
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set credential source
    pub fn with_credentials(mut self, source: CredentialSource) -> Self {
        self.credential_source = source;
        self
    }

    /// Set maximum pool size
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set query timeout
    pub fn with_query_timeout(mut self, ms: u64) -> Self {
        self.query_timeout_ms = ms;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Connection target without credentials, for logs
    pub fn redacted_target(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.driver.to_string().to_lowercase(),
            self.username,
            self.host,
            self.port(),
            self.database
        )
    }

    /// Build a connection URL with the resolved password embedded.
    ///
    /// Components are percent-encoded through `url::Url`.
    pub fn to_url(&self, password: Option<&SensitiveString>) -> Result<url::Url> {
        let scheme = match self.driver {
            Driver::Postgres => "postgres",
            Driver::MySql => "mysql",
        };
        let mut url = url::Url::parse(&format!("{}://localhost/", scheme))
            .map_err(|e| Error::config(format!("invalid url: {}", e)))?;
        url.set_host(Some(&self.host))
            .map_err(|e| Error::config(format!("invalid host {}: {}", self.host, e)))?;
        url.set_port(Some(self.port()))
            .map_err(|_| Error::config("invalid port"))?;
        url.set_username(&self.username)
            .map_err(|_| Error::config("invalid username"))?;
        if let Some(pw) = password {
            url.set_password(Some(pw.expose_secret()))
                .map_err(|_| Error::config("invalid password"))?;
        }
        url.set_path(&format!("/{}", self.database));
        Ok(url)
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Backend this factory connects to
    fn driver(&self) -> Driver;
}
