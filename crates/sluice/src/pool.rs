//! Connection pool for sluice
//!
//! Bounded pooling with:
//! - A semaphore capping checked-out connections at `max_size`
//! - Acquisition timeout surfacing as `PoolExhausted`
//! - Connection validation and recycling on borrow
//! - Metrics and observability
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::prelude::*;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::from_connection(config),
//!     Driver::Postgres.connection_factory()?,
//! ).await?;
//!
//! let conn = pool.get().await?;
//! conn.query("SELECT 1", &[]).await?;
//! // Connection is returned to the pool when dropped
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::retry::{retry_when, RetryPolicy};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Connections opened eagerly when the pool is created
    pub min_size: usize,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum time to wait for a new connection to be established
    pub connect_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl PoolConfig {
    /// Derive pool settings from connection options
    pub fn from_connection(connection: ConnectionConfig) -> Self {
        Self {
            min_size: 0,
            max_size: connection.max_pool_size.max(1),
            acquire_timeout: Duration::from_millis(connection.acquire_timeout_ms),
            connect_timeout: Duration::from_millis(connection.connect_timeout_ms),
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            test_on_borrow: true,
            connection,
        }
    }

    /// Set minimum pool size
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times pool was exhausted
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

impl PoolStats {
    /// Average wait per acquisition in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms as f64 / self.acquisitions as f64
        }
    }
}

#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
    health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Idle connection with metadata
struct PoolEntry {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO for better cache locality)
    idle: Mutex<Vec<PoolEntry>>,
    /// Permits for checked-out connections
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

/// A bounded pool of source connections.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// A connection borrowed from the pool.
///
/// Dereferences to the underlying connection; returns it to the pool on drop.
pub struct PooledConnection {
    conn: Arc<dyn Connection>,
    created_at: Instant,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.conn.clone(), self.created_at);
        // permit is released after the connection is back in the idle list
    }
}

impl PoolInner {
    fn release(&self, conn: Arc<dyn Connection>, created_at: Instant) {
        if self.shutdown.load(Ordering::Acquire) {
            self.total_connections.fetch_sub(1, Ordering::AcqRel);
            self.stats.record_closed();
            return;
        }
        self.idle.lock().push(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
    }

    async fn create_connection(&self) -> Result<Arc<dyn Connection>> {
        let connect = self.factory.connect(&self.config.connection);
        let conn = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::source_unavailable(format!(
                    "connecting to {} timed out after {}ms",
                    self.config.connection.redacted_target(),
                    self.config.connect_timeout.as_millis()
                ))
            })??;
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        self.stats.record_created();
        Ok(Arc::from(conn))
    }
}

impl ConnectionPool {
    /// Create a new connection pool.
    ///
    /// Opens `min_size` connections eagerly; the first failure is returned so
    /// an unreachable source is reported up front.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            shutdown: AtomicBool::new(false),
            factory,
            config,
        });

        for _ in 0..inner.config.min_size.min(inner.config.max_size) {
            let conn = inner.create_connection().await?;
            inner.idle.lock().push(PoolEntry {
                conn,
                created_at: Instant::now(),
                last_used: Instant::now(),
            });
        }

        Ok(Self { inner })
    }

    /// Get a connection, waiting up to the acquire timeout.
    ///
    /// Fails with `PoolExhausted` on timeout and `SourceUnavailable` when a
    /// new connection cannot be established.
    pub async fn get(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::pool_exhausted("pool is shut down"));
        }

        let start = Instant::now();
        let permit = tokio::time::timeout(
            inner.config.acquire_timeout,
            inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            inner.stats.record_exhausted();
            Error::pool_exhausted(format!(
                "timeout waiting for connection ({}ms)",
                inner.config.acquire_timeout.as_millis()
            ))
        })?
        .map_err(|_| Error::pool_exhausted("pool semaphore closed"))?;

        let reused = loop {
            let entry = inner.idle.lock().pop();
            match entry {
                Some(entry) => {
                    if inner.should_recycle(&entry) {
                        let _ = entry.conn.close().await;
                        inner.discard();
                        continue;
                    }
                    if inner.config.test_on_borrow && !entry.conn.is_valid().await {
                        inner.discard();
                        inner.stats.record_health_check_failure();
                        continue;
                    }
                    break Some((entry.conn, entry.created_at));
                }
                None => break None,
            }
        };

        let (conn, created_at) = match reused {
            Some(found) => found,
            None => (inner.create_connection().await?, Instant::now()),
        };

        let wait_ms = start.elapsed().as_millis() as u64;
        inner.stats.record_acquisition(wait_ms);
        debug!(wait_ms, in_use = self.in_use(), "connection acquired");

        Ok(PooledConnection {
            conn,
            created_at,
            pool: inner.clone(),
            _permit: permit,
        })
    }

    /// Get a connection, retrying `PoolExhausted` with backoff
    pub async fn get_with_retry(&self, policy: &RetryPolicy) -> Result<PooledConnection> {
        retry_when(
            policy,
            "acquire connection",
            |e| matches!(e, Error::PoolExhausted { .. }),
            || self.get(),
        )
        .await
    }

    /// Maximum number of concurrently checked-out connections
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Number of open connections (idle and in use)
    pub fn size(&self) -> usize {
        self.inner.total_connections.load(Ordering::Acquire)
    }

    /// Number of checked-out connections
    pub fn in_use(&self) -> usize {
        self.inner
            .config
            .max_size
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Close idle connections and refuse further acquisitions
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown.store(true, Ordering::Release);
        let drained: Vec<PoolEntry> = self.inner.idle.lock().drain(..).collect();
        for entry in drained {
            let _ = entry.conn.close().await;
            self.inner.discard();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Driver;

    #[test]
    fn test_pool_config_from_connection() {
        let conn = ConnectionConfig::new(Driver::Postgres, "localhost", "db", "u")
            .with_max_pool_size(6)
            .with_acquire_timeout(250);
        let config = PoolConfig::from_connection(conn).with_min_size(2);

        assert_eq!(config.max_size, 6);
        assert_eq!(config.min_size, 2);
        assert_eq!(config.acquire_timeout, Duration::from_millis(250));
        assert!(config.test_on_borrow);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::default();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed();
        stats.record_exhausted();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.exhausted_count, 1);
        assert_eq!(snapshot.health_check_failures, 1);

        assert!((snapshot.avg_wait_time_ms() - 150.0).abs() < 0.01);
    }
}
