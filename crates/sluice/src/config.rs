//! Extraction configuration
//!
//! Passed explicitly to the crawler, planner and engine; there is no
//! process-wide configuration state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use validator::Validate;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::schema::TableId;

/// Tuning knobs for one extraction run
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct ExtractionConfig {
    /// Rows per emitted batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub batch_size: usize,

    /// Maximum tables extracted concurrently (defaults to the pool size)
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_concurrent_tables: Option<usize>,

    /// Incremental key column per table, overriding discovery
    #[serde(default)]
    pub incremental_key_overrides: BTreeMap<String, String>,

    /// Tables always extracted in full, discarding their checkpoint
    #[serde(default)]
    pub full_reload_tables: BTreeSet<String>,

    /// Only crawl these schemas (empty = all visible schemas)
    #[serde(default)]
    pub include_schemas: Vec<String>,

    /// Tables never crawled or extracted
    #[serde(default)]
    pub exclude_tables: BTreeSet<String>,

    /// Backoff for connection acquisition when the pool is exhausted
    #[serde(default)]
    #[validate(nested)]
    pub pool_retry: RetryPolicy,

    /// Backoff for whole runs when the source is unavailable
    #[serde(default = "default_run_retry")]
    #[validate(nested)]
    pub run_retry: RetryPolicy,
}

fn default_batch_size() -> usize {
    1000
}

fn default_run_retry() -> RetryPolicy {
    RetryPolicy {
        max_backoff_ms: 60_000,
        ..RetryPolicy::default()
    }
    .with_initial_backoff(Duration::from_secs(1))
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_tables: None,
            incremental_key_overrides: BTreeMap::new(),
            full_reload_tables: BTreeSet::new(),
            include_schemas: Vec::new(),
            exclude_tables: BTreeSet::new(),
            pool_retry: RetryPolicy::default(),
            run_retry: default_run_retry(),
        }
    }
}

impl ExtractionConfig {
    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the concurrency bound
    pub fn with_max_concurrent_tables(mut self, n: usize) -> Self {
        self.max_concurrent_tables = Some(n);
        self
    }

    /// Override the incremental key of a table
    pub fn with_incremental_key(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        self.incremental_key_overrides
            .insert(table.into(), column.into());
        self
    }

    /// Force a table to reload in full on every run
    pub fn with_full_reload(mut self, table: impl Into<String>) -> Self {
        self.full_reload_tables.insert(table.into());
        self
    }

    /// Exclude a table from crawling
    pub fn with_excluded_table(mut self, table: impl Into<String>) -> Self {
        self.exclude_tables.insert(table.into());
        self
    }

    /// Set the pool acquisition retry policy
    pub fn with_pool_retry(mut self, policy: RetryPolicy) -> Self {
        self.pool_retry = policy;
        self
    }

    /// Number of concurrent table workers for a pool of `pool_size`
    pub fn effective_concurrency(&self, pool_size: usize) -> usize {
        self.max_concurrent_tables.unwrap_or(pool_size).max(1)
    }

    /// Configured incremental key override for `table`, if any
    pub fn key_override(&self, table: &TableId) -> Option<&str> {
        self.incremental_key_overrides
            .iter()
            .find(|(name, _)| table.matches(name))
            .map(|(_, col)| col.as_str())
    }

    /// Whether `table` must be reloaded in full
    pub fn is_full_reload(&self, table: &TableId) -> bool {
        self.full_reload_tables.iter().any(|t| table.matches(t))
    }

    /// Whether `table` is excluded from the crawl
    pub fn is_excluded(&self, table: &TableId) -> bool {
        self.exclude_tables.iter().any(|t| table.matches(t))
    }

    /// Whether tables in `schema` should be crawled
    pub fn includes_schema(&self, schema: Option<&str>) -> bool {
        match schema {
            _ if self.include_schemas.is_empty() => true,
            Some(s) => self.include_schemas.iter().any(|i| i == s),
            None => false,
        }
    }

    /// Check field ranges and cross-field rules
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid extraction config: {}", e)))?;
        for (table, column) in &self.incremental_key_overrides {
            if column.trim().is_empty() {
                return Err(Error::config(format!(
                    "incremental key override for {} is empty",
                    table
                )));
            }
        }
        Ok(())
    }
}
