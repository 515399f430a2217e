//! Value types for sluice
//!
//! - `Value`: a single database value as read by a driver
//! - `Row`: ordered column values of one extracted record
//! - `LogicalType`: portable classification of vendor column types
//! - `compare_watermarks`: the ordering used to guard checkpoint advancement

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// SQL value type that can hold any extracted database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 8-bit signed integer (TINYINT)
    Int8(i8),
    /// 16-bit signed integer (SMALLINT)
    Int16(i16),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CHAR)
    String(String),
    /// Binary data (BYTEA, BLOB, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
    /// Array of values
    Array(Vec<Value>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int8(_) => "TINYINT",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BYTEA",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSONB",
            Self::Array(_) => "ARRAY",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Decimal(d) if d.fract().is_zero() => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Convert to owned string representation
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::Int8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Date(d) => Some(d.to_string()),
            Self::Time(t) => Some(t.to_string()),
            Self::DateTime(dt) => Some(dt.to_string()),
            Self::DateTimeTz(dt) => Some(dt.to_rfc3339()),
            _ => None,
        }
    }

    /// Render as a plain JSON value for downstream emission.
    ///
    /// Decimals are emitted as strings to keep full precision; bytes are hex encoded.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Int8(n) => J::from(*n),
            Self::Int16(n) => J::from(*n),
            Self::Int32(n) => J::from(*n),
            Self::Int64(n) => J::from(*n),
            Self::Float32(n) => J::from(*n),
            Self::Float64(n) => J::from(*n),
            Self::Bytes(b) => J::String(hex::encode(b)),
            Self::Json(j) => j.clone(),
            Self::Array(values) => J::Array(values.iter().map(Value::to_json).collect()),
            other => other.as_string().map(J::String).unwrap_or(J::Null),
        }
    }

    /// Whether this value belongs to the numeric family
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Int8(_)
                | Self::Int16(_)
                | Self::Int32(_)
                | Self::Int64(_)
                | Self::Float32(_)
                | Self::Float64(_)
                | Self::Decimal(_)
        )
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int8(n) => Some(Decimal::from(*n)),
            Self::Int16(n) => Some(Decimal::from(*n)),
            Self::Int32(n) => Some(Decimal::from(*n)),
            Self::Int64(n) => Some(Decimal::from(*n)),
            Self::Float32(n) => Decimal::from_f32(*n),
            Self::Float64(n) => Decimal::from_f64(*n),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    fn as_naive_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::Date(d) => d.and_hms_opt(0, 0, 0),
            Self::DateTime(dt) => Some(*dt),
            Self::DateTimeTz(dt) => Some(dt.naive_utc()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            other => match other.as_string() {
                Some(s) => write!(f, "{}", s),
                None => write!(f, "{}", other.to_json()),
            },
        }
    }
}

/// Compare two watermark values.
///
/// Numeric values compare numerically across widths (integers, floats and
/// decimals). Dates and timestamps compare chronologically, with a date
/// promoted to midnight and zoned timestamps normalized to UTC. Strings and
/// UUIDs compare lexicographically. Any other pairing, including NULL or NaN,
/// is incomparable and yields `None`.
pub fn compare_watermarks(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Null, _) | (_, Null) => None,
        (x, y) if x.is_numeric() && y.is_numeric() => {
            if let (Some(l), Some(r)) = (integer_of(x), integer_of(y)) {
                return Some(l.cmp(&r));
            }
            match (x.as_decimal(), y.as_decimal()) {
                (Some(l), Some(r)) => Some(l.cmp(&r)),
                _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
            }
        }
        (Time(l), Time(r)) => Some(l.cmp(r)),
        (String(l), String(r)) => Some(l.cmp(r)),
        (Uuid(l), Uuid(r)) => Some(l.cmp(r)),
        (x, y) => {
            let l = x.as_naive_datetime()?;
            let r = y.as_naive_datetime()?;
            Some(l.cmp(&r))
        }
    }
}

/// Re-express a stored watermark in the representation a column of
/// `native_type` reads and binds as.
///
/// A checkpoint taken before a widening retype (`integer` to `bigint`,
/// integer to `numeric`, `date` to `timestamp`, naive to zoned timestamps)
/// still holds the old representation, and drivers bind parameters by the
/// column's current type. Values that already fit, and columns outside these
/// families, are returned unchanged.
pub fn coerce_watermark(value: &Value, native_type: &str) -> Result<Value> {
    let base = native_base(native_type);
    let coerced = match LogicalType::from_native(native_type) {
        LogicalType::Integer => match integer_of(value) {
            Some(n) => integer_for_width(n, &base, native_type)?,
            None => value.clone(),
        },
        LogicalType::Decimal => match integer_of(value) {
            Some(n) => Value::Decimal(Decimal::from(n)),
            None => value.clone(),
        },
        LogicalType::DateTime => {
            let zoned = base == "timestamptz" || native_type.to_lowercase().contains("with time zone");
            match (value, zoned) {
                (Value::Date(d), false) => Value::DateTime(d.and_time(NaiveTime::MIN)),
                (Value::Date(d), true) => Value::DateTimeTz(d.and_time(NaiveTime::MIN).and_utc()),
                (Value::DateTime(dt), true) => Value::DateTimeTz(dt.and_utc()),
                (Value::DateTimeTz(dt), false) => Value::DateTime(dt.naive_utc()),
                _ => value.clone(),
            }
        }
        _ => value.clone(),
    };
    Ok(coerced)
}

fn integer_for_width(n: i64, base: &str, native_type: &str) -> Result<Value> {
    let out_of_range = || {
        Error::type_conversion(format!("watermark {} does not fit column type {}", n, native_type))
    };
    if native_type.to_lowercase().contains("unsigned") {
        return Ok(Value::Int64(n));
    }
    Ok(match base {
        "tinyint" => Value::Int8(i8::try_from(n).map_err(|_| out_of_range())?),
        "smallint" | "int2" | "smallserial" | "year" => {
            Value::Int16(i16::try_from(n).map_err(|_| out_of_range())?)
        }
        "integer" | "int" | "int4" | "serial" | "mediumint" => {
            Value::Int32(i32::try_from(n).map_err(|_| out_of_range())?)
        }
        _ => Value::Int64(n),
    })
}

/// Lowercased type name without length, precision or sign modifiers
fn native_base(type_name: &str) -> String {
    let lower = type_name.trim().to_lowercase();
    let base = lower.split('(').next().unwrap_or(&lower).trim();
    base.trim_end_matches(" unsigned").to_string()
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => value.as_i64(),
        _ => None,
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Render the row as a JSON object keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .columns
            .iter()
            .zip(&self.values)
            .map(|(c, v)| (c.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Portable classification of vendor column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    /// Whole numbers of any width
    Integer,
    /// Binary floating point
    Float,
    /// Exact numeric
    Decimal,
    /// Character data
    String,
    /// True/false
    Boolean,
    /// Calendar date
    Date,
    /// Time of day
    Time,
    /// Timestamp, with or without zone
    DateTime,
    /// Raw bytes
    Binary,
    /// JSON document
    Json,
    /// UUID
    Uuid,
    /// Anything the engine does not map
    Unsupported,
}

impl LogicalType {
    /// Classify a vendor type name as reported by the catalog
    pub fn from_native(type_name: &str) -> Self {
        let base = native_base(type_name);
        match base.as_str() {
            "smallint" | "integer" | "int" | "bigint" | "tinyint" | "mediumint" | "int2"
            | "int4" | "int8" | "serial" | "bigserial" | "smallserial" | "year" => Self::Integer,
            "real" | "double precision" | "double" | "float" | "float4" | "float8" => Self::Float,
            "numeric" | "decimal" | "money" => Self::Decimal,
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text"
            | "tinytext" | "mediumtext" | "longtext" | "name" | "citext" | "enum" | "set" => {
                Self::String
            }
            "boolean" | "bool" | "bit" => Self::Boolean,
            "date" => Self::Date,
            "time" | "time without time zone" | "time with time zone" | "timetz" => Self::Time,
            "timestamp" | "timestamp without time zone" | "timestamp with time zone"
            | "timestamptz" | "datetime" => Self::DateTime,
            "bytea" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "binary"
            | "varbinary" => Self::Binary,
            "json" | "jsonb" => Self::Json,
            "uuid" => Self::Uuid,
            _ => Self::Unsupported,
        }
    }

    /// Whether values of this type have a total order usable as a watermark
    pub fn is_orderable(self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Decimal | Self::Date | Self::DateTime | Self::String
        )
    }

    /// Whether a column retyped from `self` to `to` keeps existing watermarks comparable
    pub fn widens_to(self, to: LogicalType) -> bool {
        self == to
            || matches!(
                (self, to),
                (Self::Integer, Self::Decimal) | (Self::Date, Self::DateTime)
            )
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Decimal => "DECIMAL",
            Self::String => "VARCHAR",
            Self::Boolean => "BOOLEAN",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::DateTime => "DATE_TIME",
            Self::Binary => "BINARY",
            Self::Json => "JSON",
            Self::Uuid => "UUID",
            Self::Unsupported => "UNSUPPORTED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::String("yes".into()).as_bool(), Some(true));
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::Float64(1.5).as_f64(), Some(1.5));
        assert!(Value::from(None::<i32>).is_null());
    }

    #[test]
    fn test_row_operations() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int32(1), Value::String("Alice".into())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int32(1)));
        assert_eq!(
            row.get_by_name("NAME"),
            Some(&Value::String("Alice".into()))
        );
        assert_eq!(
            row.to_json(),
            serde_json::json!({"id": 1, "name": "Alice"})
        );
    }

    #[test]
    fn test_compare_numeric_across_widths() {
        assert_eq!(
            compare_watermarks(&Value::Int32(100), &Value::Int64(150)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_watermarks(&Value::Int64(7), &Value::Decimal(Decimal::new(70, 1))),
            Some(Ordering::Equal)
        );
        assert_eq!(
            compare_watermarks(&Value::Float64(2.5), &Value::Int16(2)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_compare_temporal_promotes_dates() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let later = date.and_hms_opt(8, 0, 0).unwrap();
        assert_eq!(
            compare_watermarks(&Value::Date(date), &Value::DateTime(later)),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_watermarks(&Value::DateTimeTz(later.and_utc()), &Value::DateTime(later)),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_compare_incomparable() {
        assert_eq!(compare_watermarks(&Value::Int32(1), &Value::from("1")), None);
        assert_eq!(compare_watermarks(&Value::Null, &Value::Null), None);
        assert_eq!(
            compare_watermarks(&Value::Float64(f64::NAN), &Value::Float64(1.0)),
            None
        );
    }

    #[test]
    fn test_logical_type_from_native() {
        assert_eq!(LogicalType::from_native("bigint"), LogicalType::Integer);
        assert_eq!(LogicalType::from_native("INT(11) UNSIGNED"), LogicalType::Integer);
        assert_eq!(
            LogicalType::from_native("character varying"),
            LogicalType::String
        );
        assert_eq!(LogicalType::from_native("numeric(10,2)"), LogicalType::Decimal);
        assert_eq!(
            LogicalType::from_native("timestamp with time zone"),
            LogicalType::DateTime
        );
        assert_eq!(LogicalType::from_native("geometry"), LogicalType::Unsupported);
    }

    #[test]
    fn test_widening() {
        assert!(LogicalType::Integer.widens_to(LogicalType::Decimal));
        assert!(LogicalType::Date.widens_to(LogicalType::DateTime));
        assert!(!LogicalType::Decimal.widens_to(LogicalType::Integer));
        assert!(!LogicalType::Integer.widens_to(LogicalType::String));
    }

    #[test]
    fn test_coerce_watermark_to_wider_integer() {
        assert_eq!(
            coerce_watermark(&Value::Int32(100), "bigint").unwrap(),
            Value::Int64(100)
        );
        assert_eq!(
            coerce_watermark(&Value::Int64(100), "integer").unwrap(),
            Value::Int32(100)
        );
        assert_eq!(
            coerce_watermark(&Value::Int16(7), "int unsigned").unwrap(),
            Value::Int64(7)
        );
        let err = coerce_watermark(&Value::Int64(i64::MAX), "integer").unwrap_err();
        assert!(matches!(err, Error::TypeConversion { .. }));
    }

    #[test]
    fn test_coerce_watermark_to_decimal_and_timestamps() {
        assert_eq!(
            coerce_watermark(&Value::Int32(42), "numeric(12,2)").unwrap(),
            Value::Decimal(Decimal::from(42))
        );

        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let midnight = day.and_time(NaiveTime::MIN);
        assert_eq!(
            coerce_watermark(&Value::Date(day), "timestamp").unwrap(),
            Value::DateTime(midnight)
        );
        assert_eq!(
            coerce_watermark(&Value::DateTime(midnight), "timestamp with time zone").unwrap(),
            Value::DateTimeTz(midnight.and_utc())
        );
        assert_eq!(
            coerce_watermark(&Value::DateTimeTz(midnight.and_utc()), "timestamp").unwrap(),
            Value::DateTime(midnight)
        );
    }

    #[test]
    fn test_coerce_watermark_leaves_other_types_alone() {
        let s = Value::String("k-10".into());
        assert_eq!(coerce_watermark(&s, "varchar(20)").unwrap(), s);
        let d = Value::Decimal(Decimal::new(15, 1));
        assert_eq!(coerce_watermark(&d, "numeric").unwrap(), d);
    }
}
