//! # sluice
//!
//! Schema-driven incremental extraction from relational databases.
//!
//! Each run crawls the source catalog into a schema snapshot, diffs it
//! against the snapshot of the previous run, and plans every table as either
//! a FULL reload or an INCREMENTAL extraction resuming from a stored
//! watermark. Rows are streamed in fixed-size batches to a sink, and a
//! table's checkpoint only advances after the sink acknowledges the batch.
//!
//! ## Features
//!
//! - **Schema crawling**: tables, columns, keys, indexes and row estimates
//! - **Schema diffing**: added, removed and altered tables between runs
//! - **Planning**: FULL vs INCREMENTAL per table, smallest tables first
//! - **Streaming extraction**: `key > $1 ORDER BY key` batches with bounded memory
//! - **Checkpoints**: monotonic watermarks in memory, files or PostgreSQL
//! - **Bounded concurrency**: per-run worker limit on top of a shared pool
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let connection = ConnectionConfig::new(Driver::Postgres, "localhost", "shop", "etl");
//! let pool = ConnectionPool::new(
//!     PoolConfig::from_connection(connection.clone()),
//!     connection.driver.connection_factory()?,
//! )
//! .await?;
//!
//! let engine = Engine::new(
//!     pool,
//!     Arc::new(CatalogSchemaProvider::new(connection.driver.dialect())),
//!     connection.driver.dialect(),
//!     Arc::new(FileCheckpointStore::new("state/checkpoints").await?),
//!     Arc::new(FileSnapshotStore::new("state/snapshot.json").await?),
//!     Arc::new(JsonLinesFileSink::new("out").await?),
//!     ExtractionConfig::default(),
//! );
//!
//! let report = engine.run(CancellationToken::new()).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL sources and checkpoint store via tokio-postgres
//! - `mysql` - MySQL/MariaDB sources via mysql_async
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod crawler;
pub mod dialect;
pub mod differ;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod planner;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod security;
pub mod sink;
pub mod stores;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{compare_watermarks, LogicalType, Row, Value};

    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, CredentialSource, Driver, RowStream,
        SensitiveString,
    };

    pub use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};

    pub use crate::dialect::{MySqlDialect, PostgresDialect, SqlDialect};

    pub use crate::schema::{
        CatalogSchemaProvider, ColumnDescriptor, IndexDescriptor, MemorySnapshotStore,
        SchemaProvider, SchemaSnapshot, SnapshotStore, TableDescriptor, TableId,
    };

    pub use crate::config::ExtractionConfig;
    pub use crate::retry::RetryPolicy;

    pub use crate::crawler::SchemaCrawler;
    pub use crate::differ::{diff, ColumnChange, SchemaDelta, TableAlteration};
    pub use crate::planner::{plan, ExtractionMode, ExtractionPlan, ExtractionTask, PlanReason};
    pub use crate::extractor::{RecordBatch, RowExtractor};

    pub use crate::checkpoint::{
        Checkpoint, CheckpointStatus, CheckpointStore, CommitOutcome, MemoryCheckpointStore,
    };
    pub use crate::stores::{FileCheckpointStore, FileSnapshotStore};
    #[cfg(feature = "postgres")]
    pub use crate::stores::PostgresCheckpointStore;

    pub use crate::sink::{
        JsonLinesFileSink, MemorySink, SinkAck, SinkEmitter, StdoutFormat, StdoutSink,
    };

    pub use crate::engine::{Engine, RunReport, TableReport, TableStatus};

    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

// Re-export commonly used items at crate root
pub use engine::{Engine, RunReport};
pub use error::{Error, Result};
pub use types::Value;
