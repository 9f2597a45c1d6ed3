// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Category bookkeeping for cached query results.
//!
//! Each cached query is classified into at most one category from its text.
//! The registry remembers which keys belong to which category so a write to,
//! say, balances can drop every cached balance read without a full flush.
//!
//! Classification is a substring heuristic on the upper-cased query. The
//! first matching marker wins, in this order:
//!
//! | Marker        | Category      |
//! |---------------|---------------|
//! | `BALANCE`     | `balance`     |
//! | `STAMP`       | `stamp`       |
//! | `SRC20`       | `src20`       |
//! | `DISPENSER`   | `dispenser`   |
//! | `BLOCK`       | `block`       |
//! | `TRANSACTION` | `transaction` |

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use regex::Regex;
use serde::Serialize;

use super::key::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    Balance,
    Stamp,
    Src20,
    Dispenser,
    Block,
    Transaction,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 6] = [
        CacheCategory::Balance,
        CacheCategory::Stamp,
        CacheCategory::Src20,
        CacheCategory::Dispenser,
        CacheCategory::Block,
        CacheCategory::Transaction,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CacheCategory::Balance => "balance",
            CacheCategory::Stamp => "stamp",
            CacheCategory::Src20 => "src20",
            CacheCategory::Dispenser => "dispenser",
            CacheCategory::Block => "block",
            CacheCategory::Transaction => "transaction",
        }
    }

    fn marker(self) -> &'static str {
        match self {
            CacheCategory::Balance => "BALANCE",
            CacheCategory::Stamp => "STAMP",
            CacheCategory::Src20 => "SRC20",
            CacheCategory::Dispenser => "DISPENSER",
            CacheCategory::Block => "BLOCK",
            CacheCategory::Transaction => "TRANSACTION",
        }
    }

    /// Classify query text. `None` means the result is cached uncategorized.
    #[must_use]
    pub fn classify(sql: &str) -> Option<CacheCategory> {
        let upper = sql.to_ascii_uppercase();
        Self::ALL.into_iter().find(|c| upper.contains(c.marker()))
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| format!("unknown cache category '{s}'"))
    }
}

/// Category name to key-set map. Only bookkeeping: entries live in the tiers.
#[derive(Default)]
pub struct CacheKeyRegistry {
    categories: DashMap<CacheCategory, HashSet<CacheKey>>,
}

impl CacheKeyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `sql` and record `key` under its category, if any.
    pub fn register_key(&self, key: &CacheKey, sql: &str) -> Option<CacheCategory> {
        let category = CacheCategory::classify(sql)?;
        self.categories.entry(category).or_default().insert(key.clone());
        Some(category)
    }

    /// Snapshot of the keys registered under `category`.
    #[must_use]
    pub fn keys_for(&self, category: CacheCategory) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .categories
            .get(&category)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Remove and return every key of `category`.
    pub fn take_category(&self, category: CacheCategory) -> Vec<CacheKey> {
        self.categories
            .remove(&category)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop keys matching `pattern` from every category.
    pub fn forget_matching(&self, pattern: &Regex) -> usize {
        let mut forgotten = 0;
        for mut entry in self.categories.iter_mut() {
            let before = entry.len();
            entry.retain(|key| !pattern.is_match(key.as_str()));
            forgotten += before - entry.len();
        }
        self.categories.retain(|_, set| !set.is_empty());
        forgotten
    }

    /// Registered key count per category.
    #[must_use]
    pub fn stats(&self) -> BTreeMap<CacheCategory, usize> {
        self.categories.iter().map(|e| (*e.key(), e.value().len())).collect()
    }
}
