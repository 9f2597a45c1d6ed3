// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! MySQL sessions backed by `sqlx`.
//!
//! Each [`MySqlSession`] wraps one `MySqlConnection`; pooling is done by
//! [`crate::pool::ConnectionPool`], not by sqlx. Sessions are opened with
//! `utf8mb4` and a UTC session time zone.
//!
//! Result rows are converted to JSON objects column by column:
//!
//! | MySQL type                      | JSON            |
//! |---------------------------------|-----------------|
//! | integer types                   | number          |
//! | `FLOAT`, `DOUBLE`               | number          |
//! | `DECIMAL`                       | string (exact)  |
//! | `DATE`, `DATETIME`, `TIMESTAMP` | ISO-8601 string |
//! | `JSON`                          | nested value    |
//! | text types, `ENUM`, `SET`       | string          |
//! | binary types                    | UTF-8 string, else hex |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::mysql::{MySql, MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Row as _, TypeInfo, ValueRef};
use tracing::debug;

use super::traits::{Connector, Session};
use crate::config::DataAccessConfig;
use crate::error::{backend_error, DataError};
use crate::query::{returns_rows, QueryOutput, Row, SqlParam, WriteSummary};

/// Opens MySQL sessions with a connect deadline.
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn new(options: MySqlConnectOptions, connect_timeout: Duration) -> Self {
        Self {
            options,
            connect_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &DataAccessConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name)
            .charset("utf8mb4")
            .timezone(Some(String::from("+00:00")));
        Self::new(options, config.connect_timeout())
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, DataError> {
        let conn = tokio::time::timeout(self.connect_timeout, MySqlConnection::connect_with(&self.options))
            .await
            .map_err(|_| DataError::Connection(format!("connect timed out after {:?}", self.connect_timeout)))?
            .map_err(map_sqlx_error)?;
        debug!("MySQL session established");
        Ok(Box::new(MySqlSession { conn }))
    }
}

pub struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<QueryOutput, DataError> {
        let query = params.iter().fold(sqlx::query(sql), bind_param);

        if returns_rows(sql) {
            let rows = query.fetch_all(&mut self.conn).await.map_err(map_sqlx_error)?;
            let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>()?;
            Ok(QueryOutput::Rows(rows))
        } else {
            let done = query.execute(&mut self.conn).await.map_err(map_sqlx_error)?;
            Ok(QueryOutput::Affected(WriteSummary {
                rows_affected: done.rows_affected(),
                last_insert_id: Some(done.last_insert_id()).filter(|id| *id != 0),
            }))
        }
    }

    async fn ping(&mut self) -> Result<(), DataError> {
        self.conn.ping().await.map_err(map_sqlx_error)
    }

    async fn close(self: Box<Self>) -> Result<(), DataError> {
        self.conn.close().await.map_err(map_sqlx_error)
    }
}

fn bind_param<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    param: &'q SqlParam,
) -> Query<'q, MySql, MySqlArguments> {
    match param {
        SqlParam::Null => query.bind(None::<String>),
        SqlParam::Bool(v) => query.bind(*v),
        SqlParam::Int(v) => query.bind(*v),
        SqlParam::UInt(v) => query.bind(*v),
        SqlParam::Float(v) => query.bind(*v),
        SqlParam::Text(v) => query.bind(v.as_str()),
        SqlParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn row_to_json(row: &MySqlRow) -> Result<Row, DataError> {
    let mut out = Row::new();
    for column in row.columns() {
        let value = column_to_json(row, column.ordinal(), column.type_info().name())?;
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn column_to_json(row: &MySqlRow, idx: usize, type_name: &str) -> Result<Value, DataError> {
    if row.try_get_raw(idx).map_err(map_sqlx_error)?.is_null() {
        return Ok(Value::Null);
    }

    let upper = type_name.to_ascii_uppercase();
    let value = match upper.as_str() {
        "BOOLEAN" => json!(row.try_get_unchecked::<bool, _>(idx).map_err(map_sqlx_error)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            json!(row.try_get_unchecked::<i64, _>(idx).map_err(map_sqlx_error)?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
            json!(row.try_get_unchecked::<u64, _>(idx).map_err(map_sqlx_error)?)
        }
        "FLOAT" => json!(row.try_get_unchecked::<f32, _>(idx).map_err(map_sqlx_error)?),
        "DOUBLE" => json!(row.try_get_unchecked::<f64, _>(idx).map_err(map_sqlx_error)?),
        "DECIMAL" => json!(row.try_get_unchecked::<String, _>(idx).map_err(map_sqlx_error)?),
        "DATE" => json!(row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map_err(map_sqlx_error)?
            .to_string()),
        "DATETIME" => json!(row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map_err(map_sqlx_error)?
            .and_utc()
            .to_rfc3339()),
        "TIMESTAMP" => json!(row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map_err(map_sqlx_error)?
            .to_rfc3339()),
        "TIME" => json!(row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map_err(map_sqlx_error)?
            .to_string()),
        "JSON" => row
            .try_get::<sqlx::types::Json<Value>, _>(idx)
            .map_err(map_sqlx_error)?
            .0,
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" | "GEOMETRY" => {
            bytes_to_json(row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(map_sqlx_error)?)
        }
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => json!(text),
            Err(_) => bytes_to_json(row.try_get_unchecked::<Vec<u8>, _>(idx).map_err(map_sqlx_error)?),
        },
    };
    Ok(value)
}

fn bytes_to_json(bytes: Vec<u8>) -> Value {
    match String::from_utf8(bytes) {
        Ok(text) => Value::String(text),
        Err(e) => Value::String(hex::encode(e.into_bytes())),
    }
}

/// Map a driver error onto the crate taxonomy.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> DataError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DataError::Connection(err.to_string()),
        sqlx::Error::Database(db) => backend_error(db.message()),
        _ => DataError::Query(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_errors_are_connection_class() {
        let err = sqlx::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        assert!(map_sqlx_error(err).is_connection_class());
    }

    #[test]
    fn test_protocol_errors_are_connection_class() {
        let err = sqlx::Error::Protocol("unexpected packet".into());
        assert!(map_sqlx_error(err).is_connection_class());
    }

    #[test]
    fn test_decode_errors_are_query_class() {
        let err = sqlx::Error::ColumnNotFound("amt".into());
        assert!(matches!(map_sqlx_error(err), DataError::Query(_)));
    }

    #[test]
    fn test_binary_columns_render_as_text_or_hex() {
        assert_eq!(bytes_to_json(b"stamp".to_vec()), json!("stamp"));
        assert_eq!(bytes_to_json(vec![0xff, 0x00]), json!("ff00"));
    }

    #[test]
    fn test_connector_from_config() {
        let config = DataAccessConfig {
            db_host: "db.internal".into(),
            db_port: 3307,
            ..DataAccessConfig::default()
        };
        let connector = MySqlConnector::from_config(&config);
        assert_eq!(connector.options.get_host(), "db.internal");
        assert_eq!(connector.options.get_port(), 3307);
        assert_eq!(connector.connect_timeout, config.connect_timeout());
    }
}
