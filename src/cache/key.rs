// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic cache keys for query results.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::DataError;
use crate::query::SqlParam;

/// Key under which a query result is cached in both tiers.
///
/// Query keys are the hex SHA-256 of `"{sql}:{params-as-json}"`, so the same
/// statement with the same ordered parameters always maps to the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Use a caller-chosen key verbatim.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Derive the key for a parameterized query.
    pub fn for_query(sql: &str, params: &[SqlParam]) -> Result<Self, DataError> {
        let encoded = serde_json::to_string(params)?;
        let mut hasher = Sha256::new();
        hasher.update(sql.as_bytes());
        hasher.update(b":");
        hasher.update(encoded.as_bytes());
        Ok(Self(hex::encode(hasher.finalize())))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql_params;

    #[test]
    fn test_same_query_same_key() {
        let a = CacheKey::for_query("SELECT * FROM stamps WHERE id = ?", &sql_params![1_i64]).unwrap();
        let b = CacheKey::for_query("SELECT * FROM stamps WHERE id = ?", &sql_params![1_i64]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_params_change_key() {
        let a = CacheKey::for_query("SELECT ?", &sql_params![1_i64]).unwrap();
        let b = CacheKey::for_query("SELECT ?", &sql_params![2_i64]).unwrap();
        let c = CacheKey::for_query("SELECT ?", &sql_params!["1"]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_param_order_matters() {
        let a = CacheKey::for_query("SELECT ?, ?", &sql_params![1_i64, 2_i64]).unwrap();
        let b = CacheKey::for_query("SELECT ?, ?", &sql_params![2_i64, 1_i64]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_non_finite_floats_do_not_share_null_key() {
        let sql = "SELECT * FROM stamps WHERE floor_price > ?";
        let null = CacheKey::for_query(sql, &[SqlParam::Null]).unwrap();
        let nan = CacheKey::for_query(sql, &[SqlParam::Float(f64::NAN)]).unwrap();
        let inf = CacheKey::for_query(sql, &[SqlParam::Float(f64::INFINITY)]).unwrap();
        let neg_inf = CacheKey::for_query(sql, &[SqlParam::Float(f64::NEG_INFINITY)]).unwrap();
        let text = CacheKey::for_query(sql, &[SqlParam::Text("NaN".into())]).unwrap();

        assert_ne!(nan, null);
        assert_ne!(inf, null);
        assert_ne!(neg_inf, null);
        assert_ne!(nan, inf);
        assert_ne!(inf, neg_inf);
        assert_ne!(nan, text);
    }

    #[test]
    fn test_digest_matches_documented_input() {
        let key = CacheKey::for_query("SELECT 1", &[]).unwrap();
        let expected = hex::encode(Sha256::digest(b"SELECT 1:[]"));
        assert_eq!(key.as_str(), expected);
    }
}
