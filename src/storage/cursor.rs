//! Parameterised SQL execution with streaming, explicitly released cursors.
//!
//! `PgExecutor` runs every cursor on its own pooled connection inside a
//! spawned task that feeds a bounded channel. The consumer's pull rate is the
//! only thing that drives the fetch, so a slow HTTP client pauses the query
//! instead of growing a buffer.

use crate::geo::Extent;
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Executor, PgPool, Postgres, Row, Statement, TypeInfo};
use std::fmt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cannot decode column '{column}' of type {type_name}")]
    Decode { column: String, type_name: String },
    #[error("cursor producer stopped before describing its columns")]
    Closed,
    #[error("{0}")]
    Backend(String),
}

/// A value bound to a `$n` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    /// INT4; SRIDs must bind as this for `ST_Transform` to resolve.
    Int(i32),
    BigInt(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Null => f.write_str("NULL"),
            SqlParam::Bool(b) => write!(f, "{}", b),
            SqlParam::Int(i) => write!(f, "{}", i),
            SqlParam::BigInt(i) => write!(f, "{}", i),
            SqlParam::Float(v) => write!(f, "{}", v),
            SqlParam::Text(s) => write!(f, "'{}'", s),
            SqlParam::Bytes(b) => write!(f, "'\\x{}'", hex::encode(b)),
            SqlParam::Timestamp(t) => write!(f, "'{}'", t.to_rfc3339()),
            SqlParam::Json(v) => write!(f, "'{}'", v),
        }
    }
}

/// A decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(JsonValue),
    Bytes(Vec<u8>),
}

impl SqlValue {
    /// JSON rendering for feature properties: bytea becomes base64, non-finite floats null.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(b) => JsonValue::Bool(*b),
            SqlValue::Int(i) => JsonValue::from(*i),
            SqlValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            SqlValue::Text(s) => JsonValue::String(s.clone()),
            SqlValue::Json(v) => v.clone(),
            SqlValue::Bytes(b) => {
                JsonValue::String(base64::engine::general_purpose::STANDARD.encode(b))
            }
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            SqlValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Plain text form, used for ids and GML values.
    pub fn to_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Text(s) => s.clone(),
            other => match other.to_json() {
                JsonValue::String(s) => s,
                v => v.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub name: String,
    /// PostgreSQL type name as reported by the driver (`INT4`, `BYTEA`, ...).
    pub type_name: String,
}

impl ColumnDesc {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

pub type RawRow = Vec<SqlValue>;

enum Rows {
    Streamed(mpsc::Receiver<Result<RawRow, CursorError>>),
    Buffered(std::vec::IntoIter<RawRow>),
}

/// An open result set. Call [`RawCursor::close`] when done; dropping it
/// without closing still stops the producer and frees its connection.
pub struct RawCursor {
    columns: Vec<ColumnDesc>,
    rows: Rows,
    producer: Option<JoinHandle<()>>,
}

impl RawCursor {
    /// A cursor over rows that are already in memory.
    pub fn from_rows(columns: Vec<ColumnDesc>, rows: Vec<RawRow>) -> Self {
        Self {
            columns,
            rows: Rows::Buffered(rows.into_iter()),
            producer: None,
        }
    }

    /// A cursor fed by `producer`; closing it aborts the producer and waits for it.
    pub fn streamed(
        columns: Vec<ColumnDesc>,
        rx: mpsc::Receiver<Result<RawRow, CursorError>>,
        producer: JoinHandle<()>,
    ) -> Self {
        Self {
            columns,
            rows: Rows::Streamed(rx),
            producer: Some(producer),
        }
    }

    pub fn columns(&self) -> &[ColumnDesc] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub async fn next_row(&mut self) -> Option<Result<RawRow, CursorError>> {
        match &mut self.rows {
            Rows::Streamed(rx) => rx.recv().await,
            Rows::Buffered(iter) => iter.next().map(Ok),
        }
    }

    /// Stops the producer and waits for it to hand its connection back.
    /// A failed join is logged, never returned.
    pub async fn close(mut self) {
        if let Rows::Streamed(rx) = &mut self.rows {
            rx.close();
        }
        if let Some(handle) = self.producer.take() {
            handle.abort();
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "cursor producer failed while releasing"),
            }
        }
    }
}

impl Drop for RawCursor {
    fn drop(&mut self) {
        if let Some(handle) = self.producer.take() {
            handle.abort();
        }
    }
}

/// Raw parameterised SQL capability.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Result columns of `sql` without fetching any row.
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnDesc>, CursorError>;

    async fn open_cursor(&self, sql: &str, params: Vec<SqlParam>) -> Result<RawCursor, CursorError>;

    /// `ST_Extent` of `geometry_column` over the rows of `sql`; `None` when no row has a geometry.
    async fn extent(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        geometry_column: &str,
    ) -> Result<Option<Extent>, CursorError>;
}

pub fn extent_sql(sql: &str, geometry_column: &str) -> String {
    format!(
        "SELECT ST_XMin(e) AS minx, ST_YMin(e) AS miny, ST_XMax(e) AS maxx, ST_YMax(e) AS maxy \
         FROM (SELECT ST_Extent(q.\"{}\") AS e FROM ({}) AS q) AS x",
        geometry_column.replace('"', "\"\""),
        sql
    )
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: Vec<SqlParam>,
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Null => query.bind(None::<String>),
            SqlParam::Bool(b) => query.bind(b),
            SqlParam::Int(i) => query.bind(i),
            SqlParam::BigInt(i) => query.bind(i),
            SqlParam::Float(v) => query.bind(v),
            SqlParam::Text(s) => query.bind(s),
            SqlParam::Bytes(b) => query.bind(b),
            SqlParam::Timestamp(t) => query.bind(t),
            SqlParam::Json(v) => query.bind(sqlx::types::Json(v)),
        };
    }
    query
}

fn decode_error(column: &ColumnDesc) -> CursorError {
    CursorError::Decode {
        column: column.name.clone(),
        type_name: column.type_name.clone(),
    }
}

fn decode_value(row: &PgRow, index: usize, column: &ColumnDesc) -> Result<SqlValue, CursorError> {
    fn get<'r, T>(row: &'r PgRow, index: usize) -> Result<Option<T>, sqlx::Error>
    where
        T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
    {
        row.try_get::<Option<T>, _>(index)
    }

    let value = match column.type_name.as_str() {
        "BOOL" => get::<bool>(row, index)?.map(SqlValue::Bool),
        "INT2" => get::<i16>(row, index)?.map(|v| SqlValue::Int(v.into())),
        "INT4" => get::<i32>(row, index)?.map(|v| SqlValue::Int(v.into())),
        "INT8" => get::<i64>(row, index)?.map(SqlValue::Int),
        "FLOAT4" => get::<f32>(row, index)?.map(|v| SqlValue::Float(v.into())),
        "FLOAT8" => get::<f64>(row, index)?.map(SqlValue::Float),
        "NUMERIC" => match get::<Decimal>(row, index)? {
            Some(d) => Some(SqlValue::Float(d.to_f64().ok_or_else(|| decode_error(column))?)),
            None => None,
        },
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => get::<String>(row, index)?.map(SqlValue::Text),
        "JSON" | "JSONB" => get::<JsonValue>(row, index)?.map(SqlValue::Json),
        "TIMESTAMPTZ" => get::<DateTime<Utc>>(row, index)?.map(|t| SqlValue::Text(t.to_rfc3339())),
        "TIMESTAMP" => get::<NaiveDateTime>(row, index)?.map(|t| SqlValue::Text(t.to_string())),
        "DATE" => get::<NaiveDate>(row, index)?.map(|d| SqlValue::Text(d.to_string())),
        "BYTEA" => get::<Vec<u8>>(row, index)?.map(SqlValue::Bytes),
        // PostGIS sends geometries as EWKB in the binary protocol.
        "geometry" | "GEOMETRY" => row
            .try_get_unchecked::<Option<Vec<u8>>, _>(index)?
            .map(SqlValue::Bytes),
        _ => return Err(decode_error(column)),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn decode_row(row: &PgRow, columns: &[ColumnDesc]) -> Result<RawRow, CursorError> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| decode_value(row, i, c))
        .collect()
}

async fn describe_on(
    conn: &mut sqlx::PgConnection,
    sql: &str,
) -> Result<Vec<ColumnDesc>, CursorError> {
    let statement = (&mut *conn).prepare(sql).await?;
    Ok(statement
        .columns()
        .iter()
        .map(|c| ColumnDesc::new(c.name(), c.type_info().name()))
        .collect())
}

/// PostgreSQL implementation backed by a shared pool.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
    buffer: usize,
}

impl PgExecutor {
    pub fn new(pool: PgPool, buffer: usize) -> Self {
        Self {
            pool,
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn describe(&self, sql: &str) -> Result<Vec<ColumnDesc>, CursorError> {
        let mut conn = self.pool.acquire().await?;
        describe_on(&mut conn, sql).await
    }

    async fn open_cursor(&self, sql: &str, params: Vec<SqlParam>) -> Result<RawCursor, CursorError> {
        debug!(sql, params = params.len(), "opening cursor");
        let (columns_tx, columns_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.buffer);
        let pool = self.pool.clone();
        let sql = sql.to_string();

        let producer = tokio::spawn(async move {
            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = columns_tx.send(Err(CursorError::from(e)));
                    return;
                }
            };
            let columns = match describe_on(&mut conn, &sql).await {
                Ok(columns) => columns,
                Err(e) => {
                    let _ = columns_tx.send(Err(e));
                    return;
                }
            };
            if columns_tx.send(Ok(columns.clone())).is_err() {
                return;
            }

            let query = bind_params(sqlx::query(&sql), params);
            let mut rows = query.fetch(&mut *conn);
            while let Some(item) = rows.next().await {
                let row = item
                    .map_err(CursorError::from)
                    .and_then(|r| decode_row(&r, &columns));
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    break;
                }
            }
        });

        match columns_rx.await {
            Ok(Ok(columns)) => Ok(RawCursor::streamed(columns, rx, producer)),
            Ok(Err(e)) => {
                let _ = producer.await;
                Err(e)
            }
            Err(_) => {
                if let Err(e) = producer.await {
                    error!(error = %e, "cursor producer terminated abnormally");
                }
                Err(CursorError::Closed)
            }
        }
    }

    async fn extent(
        &self,
        sql: &str,
        params: Vec<SqlParam>,
        geometry_column: &str,
    ) -> Result<Option<Extent>, CursorError> {
        let sql = extent_sql(sql, geometry_column);
        debug!(sql, "computing extent");
        let row = bind_params(sqlx::query(&sql), params)
            .fetch_one(&self.pool)
            .await?;
        let minx: Option<f64> = row.try_get("minx")?;
        let miny: Option<f64> = row.try_get("miny")?;
        let maxx: Option<f64> = row.try_get("maxx")?;
        let maxy: Option<f64> = row.try_get("maxy")?;
        Ok(match (minx, miny, maxx, maxy) {
            (Some(a), Some(b), Some(c), Some(d)) => Some(Extent::new(a, b, c, d)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_cursor_yields_rows_in_order() {
        let mut cursor = RawCursor::from_rows(
            vec![ColumnDesc::new("id", "INT4"), ColumnDesc::new("name", "TEXT")],
            vec![
                vec![SqlValue::Int(1), SqlValue::Text("a".into())],
                vec![SqlValue::Int(2), SqlValue::Null],
            ],
        );
        assert_eq!(cursor.column_index("name"), Some(1));
        assert_eq!(cursor.next_row().await.unwrap().unwrap()[0], SqlValue::Int(1));
        assert_eq!(cursor.next_row().await.unwrap().unwrap()[1], SqlValue::Null);
        assert!(cursor.next_row().await.is_none());
        cursor.close().await;
    }

    #[tokio::test]
    async fn closing_a_streamed_cursor_stops_the_producer() {
        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            let mut n = 0i64;
            while tx.send(Ok(vec![SqlValue::Int(n)])).await.is_ok() {
                n += 1;
            }
        });
        let mut cursor = RawCursor::streamed(vec![ColumnDesc::new("n", "INT8")], rx, producer);
        assert_eq!(cursor.next_row().await.unwrap().unwrap(), vec![SqlValue::Int(0)]);
        cursor.close().await;
    }

    #[test]
    fn values_render_as_json_properties() {
        assert_eq!(SqlValue::Float(1.5).to_json(), serde_json::json!(1.5));
        assert_eq!(SqlValue::Float(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(SqlValue::Bytes(vec![1, 2, 3]).to_json(), serde_json::json!("AQID"));
        assert_eq!(SqlValue::Int(7).to_text(), "7");
        assert_eq!(SqlValue::Text("12".into()).as_i64(), Some(12));
    }

    #[test]
    fn extent_wraps_the_filtered_query() {
        assert_eq!(
            extent_sql("select id, geom as shape from t where id = $1", "shape"),
            "SELECT ST_XMin(e) AS minx, ST_YMin(e) AS miny, ST_XMax(e) AS maxx, ST_YMax(e) AS maxy \
             FROM (SELECT ST_Extent(q.\"shape\") AS e FROM (select id, geom as shape from t where id = $1) AS q) AS x"
        );
        assert_eq!(SqlParam::Bytes(vec![0xab]).to_string(), "'\\xab'");
    }
}
