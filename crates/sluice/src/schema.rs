//! Schema model and catalog introspection
//!
//! - `TableId`: `catalog.schema.table` identity, the key for checkpoints and config
//! - `ColumnDescriptor` / `IndexDescriptor` / `TableDescriptor`: validated table shape
//! - `SchemaSnapshot`: immutable, identity-ordered set of tables captured at one instant
//! - `SchemaProvider`: catalog queries over a live connection
//! - `SnapshotStore`: persistence of the last planned snapshot

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::connection::Connection;
use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::types::{LogicalType, Row, Value};

/// Fully qualified table identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Catalog (database) name, when the backend reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    /// Schema name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Table name
    pub name: String,
}

impl TableId {
    /// Create a table identity without catalog
    pub fn new(schema: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: schema.map(str::to_string),
            name: name.into(),
        }
    }

    /// Set the catalog
    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Parse `table`, `schema.table` or `catalog.schema.table`
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::config(format!("invalid table identity '{}'", s)));
        }
        match parts.as_slice() {
            [name] => Ok(Self::new(None, *name)),
            [schema, name] => Ok(Self::new(Some(*schema), *name)),
            [catalog, schema, name] => Ok(Self::new(Some(*schema), *name).with_catalog(*catalog)),
            _ => Err(Error::config(format!("invalid table identity '{}'", s))),
        }
    }

    /// Get fully qualified name
    pub fn qualified_name(&self) -> String {
        let mut out = String::new();
        for part in [&self.catalog, &self.schema].into_iter().flatten() {
            out.push_str(part);
            out.push('.');
        }
        out.push_str(&self.name);
        out
    }

    /// Whether a configured table reference names this table.
    ///
    /// Accepts the fully qualified name, `schema.table`, or the bare table name.
    pub fn matches(&self, reference: &str) -> bool {
        if reference == self.name || reference == self.qualified_name() {
            return true;
        }
        match &self.schema {
            Some(schema) => reference
                .strip_prefix(schema.as_str())
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|rest| rest == self.name),
            None => false,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

impl PartialOrd for TableId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TableId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.qualified_name()
            .cmp(&other.qualified_name())
            .then_with(|| (&self.catalog, &self.schema).cmp(&(&other.catalog, &other.schema)))
    }
}

/// Column shape as reported by the catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Vendor type name
    pub native_type: String,
    /// Portable type
    pub logical_type: LogicalType,
    /// Whether column is nullable
    pub nullable: bool,
    /// Column ordinal (1-based)
    pub ordinal: u32,
    /// Primary key ordinal (1-based, None if not PK)
    #[serde(default)]
    pub primary_key_ordinal: Option<u32>,
    /// Auto-increment/serial/identity
    #[serde(default)]
    pub auto_increment: bool,
    /// Maximum length for string/binary types
    #[serde(default)]
    pub max_length: Option<u32>,
    /// Precision for numeric types
    #[serde(default)]
    pub precision: Option<u32>,
    /// Scale for numeric types
    #[serde(default)]
    pub scale: Option<u32>,
    /// Default value expression
    #[serde(default)]
    pub default_value: Option<String>,
}

impl ColumnDescriptor {
    /// Create a nullable column; the logical type is derived from `native_type`
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        let native_type = native_type.into();
        Self {
            name: name.into(),
            logical_type: LogicalType::from_native(&native_type),
            native_type,
            nullable: true,
            ordinal: 0,
            primary_key_ordinal: None,
            auto_increment: false,
            max_length: None,
            precision: None,
            scale: None,
            default_value: None,
        }
    }

    /// Mark as primary key member at `ordinal` (implies NOT NULL)
    pub fn primary_key(mut self, ordinal: u32) -> Self {
        self.primary_key_ordinal = Some(ordinal);
        self.nullable = false;
        self
    }

    /// Mark as auto-increment
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Check if this column is part of the primary key
    #[inline]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key_ordinal.is_some()
    }
}

/// Index shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index name
    pub name: String,
    /// Column names (in order)
    pub columns: Vec<String>,
    /// Whether the index is unique
    pub unique: bool,
    /// Whether this is the primary key index
    pub primary: bool,
}

/// Validated table shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Table identity
    pub id: TableId,
    /// Columns in ordinal order
    pub columns: Vec<ColumnDescriptor>,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
    /// Column used for incremental extraction
    #[serde(default)]
    pub incremental_key: Option<String>,
    /// Estimated row count from catalog statistics
    #[serde(default)]
    pub estimated_rows: Option<u64>,
    /// Indexes
    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,
}

impl TableDescriptor {
    /// Build a descriptor, checking column-name uniqueness.
    ///
    /// The primary key is taken from the columns' key ordinals.
    pub fn new(id: TableId, mut columns: Vec<ColumnDescriptor>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(columns.len());
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return Err(Error::introspection(format!(
                    "duplicate column {} in {}",
                    col.name, id
                )));
            }
        }
        for (i, col) in columns.iter_mut().enumerate() {
            if col.ordinal == 0 {
                col.ordinal = i as u32 + 1;
            }
        }
        let mut pk: Vec<&ColumnDescriptor> =
            columns.iter().filter(|c| c.is_primary_key()).collect();
        pk.sort_by_key(|c| c.primary_key_ordinal);
        let primary_key = pk.into_iter().map(|c| c.name.clone()).collect();

        Ok(Self {
            id,
            columns,
            primary_key,
            incremental_key: None,
            estimated_rows: None,
            indexes: Vec::new(),
        })
    }

    /// Set the incremental key; the column must exist
    pub fn with_incremental_key(mut self, column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        if self.column(&column).is_none() {
            return Err(Error::introspection(format!(
                "incremental key {} is not a column of {}",
                column, self.id
            )));
        }
        self.incremental_key = Some(column);
        Ok(self)
    }

    /// Set the primary key explicitly; every column must exist
    pub fn with_primary_key(mut self, columns: Vec<String>) -> Result<Self> {
        if let Some(missing) = columns.iter().find(|c| self.column(c).is_none()) {
            return Err(Error::introspection(format!(
                "primary key column {} is not a column of {}",
                missing, self.id
            )));
        }
        self.primary_key = columns;
        Ok(self)
    }

    /// Set the estimated row count
    pub fn with_estimated_rows(mut self, rows: Option<u64>) -> Self {
        self.estimated_rows = rows;
        self
    }

    /// Set indexes
    pub fn with_indexes(mut self, indexes: Vec<IndexDescriptor>) -> Self {
        self.indexes = indexes;
        self
    }

    /// Get column by exact name
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The incremental key column, if any
    pub fn incremental_key_column(&self) -> Option<&ColumnDescriptor> {
        self.incremental_key.as_deref().and_then(|k| self.column(k))
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Stable hash of the table's structure.
    ///
    /// Covers column names, native types, nullability, key membership and the
    /// incremental key; statistics and indexes are excluded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.qualified_name().as_bytes());
        for col in &self.columns {
            hasher.update(b"\0col\0");
            hasher.update(col.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(col.native_type.to_lowercase().as_bytes());
            hasher.update([u8::from(col.nullable)]);
            hasher.update(col.primary_key_ordinal.unwrap_or(0).to_be_bytes());
        }
        hasher.update(b"\0key\0");
        if let Some(k) = &self.incremental_key {
            hasher.update(k.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Immutable set of tables captured at one instant, ordered by identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: Vec<TableDescriptor>,
    captured_at: DateTime<Utc>,
}

impl SchemaSnapshot {
    /// Build a snapshot; duplicate identities are rejected
    pub fn new(mut tables: Vec<TableDescriptor>, captured_at: DateTime<Utc>) -> Result<Self> {
        tables.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(pair) = tables.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(Error::introspection(format!(
                "table {} reported twice",
                pair[0].id
            )));
        }
        Ok(Self {
            tables,
            captured_at,
        })
    }

    /// A snapshot with no tables
    pub fn empty() -> Self {
        Self {
            tables: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// Tables in identity order
    pub fn tables(&self) -> &[TableDescriptor] {
        &self.tables
    }

    /// Look up a table
    pub fn get(&self, id: &TableId) -> Option<&TableDescriptor> {
        self.tables
            .binary_search_by(|t| t.id.cmp(id))
            .ok()
            .map(|i| &self.tables[i])
    }

    /// Capture timestamp
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot has no tables
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Read-only catalog access over a live connection
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// List base tables, restricted to `include_schemas` when non-empty
    async fn list_tables(
        &self,
        conn: &dyn Connection,
        include_schemas: &[String],
    ) -> Result<Vec<TableId>>;

    /// Columns of a table in ordinal order
    async fn list_columns(
        &self,
        conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Vec<ColumnDescriptor>>;

    /// Indexes of a table
    async fn list_indexes(
        &self,
        conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Vec<IndexDescriptor>>;

    /// Estimated row count, if statistics are available
    async fn estimate_rows(&self, conn: &dyn Connection, table: &TableId) -> Result<Option<u64>>;
}

/// `SchemaProvider` driven by a dialect's information_schema queries
pub struct CatalogSchemaProvider {
    dialect: Arc<dyn SqlDialect>,
}

impl CatalogSchemaProvider {
    /// Create a provider for `dialect`
    pub fn new(dialect: Arc<dyn SqlDialect>) -> Self {
        Self { dialect }
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get_by_name(column) {
        None | Some(Value::Null) => None,
        Some(Value::Bytes(b)) => String::from_utf8(b.clone()).ok(),
        Some(v) => v.as_string(),
    }
}

fn int(row: &Row, column: &str) -> Option<i64> {
    row.get_by_name(column).and_then(Value::as_i64)
}

fn flag(row: &Row, column: &str) -> bool {
    row.get_by_name(column)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn required_text(row: &Row, column: &str) -> Result<String> {
    text(row, column).ok_or_else(|| {
        Error::introspection(format!("catalog row is missing column {}", column))
    })
}

fn to_u32(v: Option<i64>) -> Option<u32> {
    v.and_then(|n| u32::try_from(n).ok())
}

#[async_trait]
impl SchemaProvider for CatalogSchemaProvider {
    async fn list_tables(
        &self,
        conn: &dyn Connection,
        include_schemas: &[String],
    ) -> Result<Vec<TableId>> {
        let sql = self.dialect.list_tables_sql(include_schemas);
        let rows = conn.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                let mut id = TableId::new(
                    text(row, "table_schema").as_deref(),
                    required_text(row, "table_name")?,
                );
                id.catalog = text(row, "table_catalog");
                Ok(id)
            })
            .collect()
    }

    async fn list_columns(
        &self,
        conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Vec<ColumnDescriptor>> {
        let sql = self
            .dialect
            .list_columns_sql(table.schema.as_deref(), &table.name);
        let rows = conn.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| {
                let mut col = ColumnDescriptor::new(
                    required_text(row, "column_name")?,
                    required_text(row, "data_type")?,
                );
                col.nullable = flag(row, "nullable");
                col.ordinal = to_u32(int(row, "ordinal_position")).unwrap_or(0);
                col.primary_key_ordinal = to_u32(int(row, "pk_ordinal"));
                col.auto_increment = flag(row, "auto_increment");
                col.max_length = to_u32(int(row, "character_maximum_length"));
                col.precision = to_u32(int(row, "numeric_precision"));
                col.scale = to_u32(int(row, "numeric_scale"));
                col.default_value = text(row, "column_default");
                Ok(col)
            })
            .collect()
    }

    async fn list_indexes(
        &self,
        conn: &dyn Connection,
        table: &TableId,
    ) -> Result<Vec<IndexDescriptor>> {
        let sql = self
            .dialect
            .list_indexes_sql(table.schema.as_deref(), &table.name);
        let rows = conn.query(&sql, &[]).await?;

        let mut by_name: BTreeMap<String, IndexDescriptor> = BTreeMap::new();
        for row in &rows {
            let name = required_text(row, "index_name")?;
            let entry = by_name
                .entry(name.clone())
                .or_insert_with(|| IndexDescriptor {
                    name,
                    columns: Vec::new(),
                    unique: flag(row, "is_unique"),
                    primary: flag(row, "is_primary"),
                });
            entry.columns.push(required_text(row, "column_name")?);
        }
        Ok(by_name.into_values().collect())
    }

    async fn estimate_rows(&self, conn: &dyn Connection, table: &TableId) -> Result<Option<u64>> {
        let sql = self
            .dialect
            .estimate_rows_sql(table.schema.as_deref(), &table.name);
        let row = conn.query_one(&sql, &[]).await?;
        // negative reltuples means the table was never analyzed
        Ok(row
            .and_then(|r| int(&r, "estimated_rows"))
            .and_then(|n| u64::try_from(n).ok()))
    }
}

/// Persistence for the last planned schema snapshot
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the previous snapshot, if any
    async fn load(&self) -> Result<Option<SchemaSnapshot>>;

    /// Replace the stored snapshot
    async fn save(&self, snapshot: &SchemaSnapshot) -> Result<()>;
}

/// In-memory snapshot store
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: RwLock<Option<SchemaSnapshot>>,
}

impl MemorySnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<SchemaSnapshot>> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &SchemaSnapshot) -> Result<()> {
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }
}
