//! Configuration file for the `sluice` binary
//!
//! ```yaml
//! source:
//!   driver: postgres
//!   host: ${PGHOST:-localhost}
//!   database: shop
//!   username: etl
//!   credential_source: { type: env, var: PGPASSWORD }
//! extraction:
//!   batch_size: 5000
//!   full_reload_tables: [public.currencies]
//! state:
//!   backend: file
//!   dir: ./state
//! sink:
//!   type: jsonl
//!   dir: ./out
//! ```

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use validator::Validate;

use sluice::prelude::{ConnectionConfig, ExtractionConfig, StdoutFormat};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SluiceConfig {
    /// Source database
    #[validate(nested)]
    pub source: ConnectionConfig,

    /// Extraction behaviour
    #[serde(default)]
    #[validate(nested)]
    pub extraction: ExtractionConfig,

    /// Where checkpoints and the schema snapshot are kept
    #[serde(default)]
    #[validate(nested)]
    pub state: StateConfig,

    /// Where extracted rows go
    #[serde(default)]
    #[validate(nested)]
    pub sink: SinkConfig,
}

/// Checkpoint backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON files under `state.dir`
    #[default]
    File,
    /// Process memory; every run starts from scratch
    Memory,
    /// Metadata table in the (PostgreSQL) source database
    Postgres,
}

/// Persistent state settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct StateConfig {
    /// Checkpoint backend
    #[serde(default)]
    pub backend: StateBackend,

    /// Directory for checkpoint files and the schema snapshot
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// Metadata table name for the postgres backend
    #[serde(default)]
    #[validate(length(min = 1, max = 63))]
    pub table: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            dir: default_state_dir(),
            table: None,
        }
    }
}

impl StateConfig {
    /// Directory holding one checkpoint file per table
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.dir.join("checkpoints")
    }

    /// File holding the schema snapshot of the last run
    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// Sink type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One `.jsonl` file per table under `sink.dir`
    Jsonl,
    /// Rows printed to stdout
    #[default]
    Stdout,
}

/// Sink settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct SinkConfig {
    /// Sink type
    #[serde(rename = "type", default)]
    pub kind: SinkKind,

    /// Output directory for the jsonl sink
    #[serde(default = "default_sink_dir")]
    pub dir: PathBuf,

    /// Row format for the stdout sink
    #[serde(default)]
    pub format: StdoutFormat,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            dir: default_sink_dir(),
            format: StdoutFormat::default(),
        }
    }
}

fn default_sink_dir() -> PathBuf {
    PathBuf::from("out")
}

impl SluiceConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded).context("Failed to parse config")?;
        config.check()?;
        Ok(config)
    }

    /// Range checks plus rules spanning sections
    pub fn check(&self) -> Result<()> {
        self.validate().context("Config validation failed")?;
        self.extraction.check()?;

        if self.state.backend == StateBackend::Postgres
            && self.source.driver != sluice::prelude::Driver::Postgres
        {
            anyhow::bail!(
                "state backend 'postgres' keeps checkpoints in the source database and needs a postgres source, not {}",
                self.source.driver
            );
        }
        if let Some(table) = &self.state.table {
            sluice::security::validate_sql_identifier(table)
                .with_context(|| format!("Invalid state table name '{}'", table))?;
        }
        Ok(())
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
