// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed query parameters and results.
//!
//! Parameters are a closed enum so they can be bound by any driver and
//! hashed deterministically into cache keys. Results keep the column-keyed
//! shape the backend returns and are decoded into caller types with `serde`.

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::DataError;

/// A single bound parameter.
///
/// Serializes untagged, so `[Int(1), Text("a")]` becomes `[1,"a"]`. The cache
/// key digest relies on this encoding being stable. Non-finite floats have no
/// JSON number form and encode as `{"float":"NaN"}`, `{"float":"inf"}` or
/// `{"float":"-inf"}` so they never share a key with `Null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(#[serde(serialize_with = "serialize_float")] f64),
    Text(String),
    Bytes(Vec<u8>),
}

fn serialize_float<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        return serializer.serialize_f64(*value);
    }
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry("float", &value.to_string())?;
    map.end()
}

impl From<bool> for SqlParam {
    fn from(v: bool) -> Self {
        SqlParam::Bool(v)
    }
}

impl From<i32> for SqlParam {
    fn from(v: i32) -> Self {
        SqlParam::Int(i64::from(v))
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Int(v)
    }
}

impl From<u32> for SqlParam {
    fn from(v: u32) -> Self {
        SqlParam::UInt(u64::from(v))
    }
}

impl From<u64> for SqlParam {
    fn from(v: u64) -> Self {
        SqlParam::UInt(v)
    }
}

impl From<usize> for SqlParam {
    fn from(v: usize) -> Self {
        SqlParam::UInt(v as u64)
    }
}

impl From<f64> for SqlParam {
    fn from(v: f64) -> Self {
        SqlParam::Float(v)
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(v)
    }
}

impl From<&String> for SqlParam {
    fn from(v: &String) -> Self {
        SqlParam::Text(v.clone())
    }
}

impl From<Vec<u8>> for SqlParam {
    fn from(v: Vec<u8>) -> Self {
        SqlParam::Bytes(v)
    }
}

impl<T: Into<SqlParam>> From<Option<T>> for SqlParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlParam::Null, Into::into)
    }
}

/// Build a `Vec<SqlParam>` from heterogeneous values.
///
/// ```
/// use stamps_data::{sql_params, SqlParam};
///
/// let params = sql_params!["bc1qxyz", 10_i64, None::<i64>];
/// assert_eq!(params[1], SqlParam::Int(10));
/// assert_eq!(params[2], SqlParam::Null);
/// ```
#[macro_export]
macro_rules! sql_params {
    () => {
        ::std::vec::Vec::<$crate::SqlParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        vec![$($crate::SqlParam::from($value)),+]
    };
}

/// One result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Outcome of a statement that does not return rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

/// What a statement produced: rows for reads, counts for writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutput {
    Rows(Vec<Row>),
    Affected(WriteSummary),
}

impl QueryOutput {
    /// Rows for a read, empty slice for a write.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Affected(_) => &[],
        }
    }

    /// Rows affected for a write, row count for a read.
    #[must_use]
    pub fn affected(&self) -> u64 {
        match self {
            QueryOutput::Rows(rows) => rows.len() as u64,
            QueryOutput::Affected(summary) => summary.rows_affected,
        }
    }

    /// Decode every row into `T`.
    ///
    /// A write decodes to an empty vector. A row that does not match `T`
    /// fails the whole decode.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Vec<T>, DataError> {
        match self {
            QueryOutput::Rows(rows) => rows
                .into_iter()
                .map(|row| serde_json::from_value(serde_json::Value::Object(row)).map_err(DataError::from))
                .collect(),
            QueryOutput::Affected(_) => Ok(Vec::new()),
        }
    }
}

/// Statements that produce a result set rather than an affected-row count.
#[must_use]
pub fn returns_rows(sql: &str) -> bool {
    let first = sql
        .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or("");
    matches!(
        first.to_ascii_uppercase().as_str(),
        "SELECT" | "SHOW" | "WITH" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE"
    )
}
