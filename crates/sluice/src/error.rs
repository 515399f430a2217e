//! Error types for sluice
//!
//! Errors are classified by how far they reach:
//! - Run-level: source unavailable (retried with backoff), introspection (aborts the run)
//! - Table-level: extraction, checkpoint write, sink (isolated to one table)
//! - Local: pool exhausted (bounded retry before escalating)

use std::fmt;
use thiserror::Error;

use crate::schema::TableId;

/// Result type for sluice operations
pub type Result<T> = std::result::Result<T, Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source database cannot be reached (retriable at run level)
    SourceUnavailable,
    /// Metadata introspection failed (aborts the run)
    Introspection,
    /// Row extraction failed for one table
    Extraction,
    /// Connection pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Checkpoint could not be persisted
    CheckpointWrite,
    /// Downstream sink rejected a batch
    Sink,
    /// Query execution errors
    Query,
    /// Timeout errors (retriable)
    Timeout,
    /// Type conversion errors (not retriable)
    TypeConversion,
    /// Configuration error
    Configuration,
    /// Schema-related errors
    Schema,
    /// Run was cancelled
    Cancelled,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::Timeout | Self::PoolExhausted
        )
    }
}

/// Main error type for sluice
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Source database could not be reached or authenticated against
    #[error("source unavailable: {message}")]
    SourceUnavailable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Schema introspection failed partway
    #[error("introspection error: {message}")]
    Introspection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Extraction of a single table failed
    #[error("extraction error on {table}: {source}")]
    Extraction {
        table: TableId,
        #[source]
        source: Box<Error>,
    },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Checkpoint could not be written
    #[error("checkpoint write error on {table}: {message}")]
    CheckpointWrite {
        table: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Sink rejected or failed to acknowledge a batch
    #[error("sink error on {table}: {message}")]
    Sink { table: String, message: String },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Schema error (invalid descriptor, unknown column)
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Operation was cancelled
    #[error("cancelled")]
    Cancelled,

    /// Unsupported operation for this backend
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SourceUnavailable { .. } => ErrorCategory::SourceUnavailable,
            Self::Introspection { .. } => ErrorCategory::Introspection,
            Self::Extraction { .. } => ErrorCategory::Extraction,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::CheckpointWrite { .. } => ErrorCategory::CheckpointWrite,
            Self::Sink { .. } => ErrorCategory::Sink,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Walk through `Extraction` wrappers to the underlying cause
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Extraction { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a source-unavailable error with source
    pub fn source_unavailable_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::SourceUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an introspection error
    pub fn introspection(message: impl Into<String>) -> Self {
        Self::Introspection {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap any error raised while reading metadata as an introspection error.
    ///
    /// Source unavailability keeps its own category so the run can be retried.
    pub fn into_introspection(self, context: &str) -> Self {
        match self {
            e @ (Self::SourceUnavailable { .. } | Self::Introspection { .. }) => e,
            other => Self::Introspection {
                message: format!("{}: {}", context, other),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Wrap an error as an extraction failure of `table`
    pub fn extraction(table: TableId, source: Error) -> Self {
        match source {
            e @ Self::Extraction { .. } => e,
            other => Self::Extraction {
                table,
                source: Box::new(other),
            },
        }
    }

    /// Create a pool-exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a checkpoint write error
    pub fn checkpoint_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CheckpointWrite {
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a checkpoint write error with source
    pub fn checkpoint_write_with(
        table: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CheckpointWrite {
            table: table.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a sink error
    pub fn sink(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sink {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SourceUnavailable => write!(f, "source_unavailable"),
            Self::Introspection => write!(f, "introspection"),
            Self::Extraction => write!(f, "extraction"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::CheckpointWrite => write!(f, "checkpoint_write"),
            Self::Sink => write!(f, "sink"),
            Self::Query => write!(f, "query"),
            Self::Timeout => write!(f, "timeout"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Configuration => write!(f, "configuration"),
            Self::Schema => write!(f, "schema"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal {
            message: format!("I/O error: {}", e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", e),
        }
    }
}
