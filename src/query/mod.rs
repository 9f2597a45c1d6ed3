// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query parameters, results and the retrying executor.

pub mod executor;
pub mod types;

pub use executor::QueryExecutor;
pub use types::{returns_rows, QueryOutput, Row, SqlParam, WriteSummary};
