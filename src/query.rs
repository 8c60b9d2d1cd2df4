//! Raw query execution against the tenant-scoped connection.
//!
//! Executes parameterized SQL templates and maps rows to typed results
//! using the declared result columns. Every operation acquires one pooled
//! connection, pins it to the active tenant schema via `search_path`, and
//! returns it to the pool on drop in every exit path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Column, PgPool, Postgres, Row, pool::PoolConnection};
use tracing::debug;

use crate::error::{EngineError, Result, classify_db_error};
use crate::metadata::{ColumnSpec, ParameterType};
use crate::sql::sanitize::{quote_identifier, validate_identifier};

/// A parameter value coerced to its declared type, ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Long(i64),
    Decimal(Decimal),
    Double(f64),
    Float(f32),
    Text(String),
    Bool(bool),
    DateTime(DateTime<Utc>),
    Guid(uuid::Uuid),
    /// A typed NULL; the type drives which SQL type the NULL binds as.
    Null(ParameterType),
}

impl ParamValue {
    /// Coerce a JSON value into a typed parameter.
    pub fn from_json(kind: ParameterType, value: &Value) -> std::result::Result<Self, String> {
        let coerced = kind.coerce(value)?;
        if coerced.is_null() {
            return Ok(ParamValue::Null(kind));
        }

        // coerce() already normalized the representation per type.
        Ok(match kind {
            ParameterType::Int => ParamValue::Int(coerced.as_i64().unwrap_or_default() as i32),
            ParameterType::Long => ParamValue::Long(coerced.as_i64().unwrap_or_default()),
            ParameterType::Decimal => {
                let text = match &coerced {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ParamValue::Decimal(
                    text.parse::<Decimal>()
                        .map_err(|_| format!("cannot convert '{}' to decimal", text))?,
                )
            }
            ParameterType::Double => ParamValue::Double(coerced.as_f64().unwrap_or_default()),
            ParameterType::Float => ParamValue::Float(coerced.as_f64().unwrap_or_default() as f32),
            ParameterType::String => {
                ParamValue::Text(coerced.as_str().unwrap_or_default().to_string())
            }
            ParameterType::Bool => ParamValue::Bool(coerced.as_bool().unwrap_or_default()),
            ParameterType::DateTime => {
                let text = coerced.as_str().unwrap_or_default();
                ParamValue::DateTime(
                    DateTime::parse_from_rfc3339(text)
                        .map_err(|e| format!("invalid datetime '{}': {}", text, e))?
                        .with_timezone(&Utc),
                )
            }
            ParameterType::Guid => {
                let text = coerced.as_str().unwrap_or_default();
                ParamValue::Guid(
                    uuid::Uuid::parse_str(text)
                        .map_err(|_| format!("'{}' is not a valid guid", text))?,
                )
            }
        })
    }
}

/// Bind a typed parameter onto a query.
pub(crate) fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &ParamValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        ParamValue::Int(v) => query.bind(*v),
        ParamValue::Long(v) => query.bind(*v),
        ParamValue::Decimal(v) => query.bind(*v),
        ParamValue::Double(v) => query.bind(*v),
        ParamValue::Float(v) => query.bind(*v),
        ParamValue::Text(v) => query.bind(v.clone()),
        ParamValue::Bool(v) => query.bind(*v),
        ParamValue::DateTime(v) => query.bind(*v),
        ParamValue::Guid(v) => query.bind(*v),
        ParamValue::Null(kind) => match kind {
            ParameterType::Int => query.bind(None::<i32>),
            ParameterType::Long => query.bind(None::<i64>),
            ParameterType::Decimal => query.bind(None::<Decimal>),
            ParameterType::Double => query.bind(None::<f64>),
            ParameterType::Float => query.bind(None::<f32>),
            ParameterType::String => query.bind(None::<String>),
            ParameterType::Bool => query.bind(None::<bool>),
            ParameterType::DateTime => query.bind(None::<DateTime<Utc>>),
            ParameterType::Guid => query.bind(None::<uuid::Uuid>),
        },
    }
}

/// Acquire a pooled connection pinned to the given tenant schema.
///
/// The schema is validated and quoted before it reaches `search_path`.
/// The connection returns to the pool when the returned guard drops,
/// whether the caller completes, errors, or is cancelled.
pub(crate) async fn acquire_tenant_conn(
    pool: &PgPool,
    schema: &str,
    statement_timeout: Option<Duration>,
) -> Result<PoolConnection<Postgres>> {
    validate_identifier(schema)
        .map_err(|e| EngineError::invalid_parameter(format!("tenant schema: {}", e)))?;

    let mut conn = pool.acquire().await.map_err(classify_db_error)?;

    let set_path = format!("SET search_path TO {}", quote_identifier(schema));
    sqlx::query(&set_path)
        .execute(conn.as_mut())
        .await
        .map_err(classify_db_error)?;

    if let Some(timeout) = statement_timeout {
        let set_timeout = format!("SET statement_timeout = {}", timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(conn.as_mut())
            .await
            .map_err(classify_db_error)?;
    }

    Ok(conn)
}

/// Build a JSON object from a row using the declared columns.
///
/// Row columns are matched by name case-insensitively; a declared column
/// missing from the result set is an invalid-operation error naming it.
pub(crate) fn row_to_object<C: ColumnSpec>(
    row: &PgRow,
    columns: &[C],
) -> Result<serde_json::Map<String, Value>> {
    let mut object = serde_json::Map::with_capacity(columns.len());

    for spec in columns {
        let ordinal = row
            .columns()
            .iter()
            .position(|c| c.name().eq_ignore_ascii_case(spec.column_name()))
            .ok_or_else(|| {
                EngineError::invalid_operation(format!(
                    "column '{}' is declared but missing from the result set",
                    spec.column_name()
                ))
            })?;

        let value = match spec.column_type() {
            ParameterType::Int => row
                .try_get::<Option<i32>, _>(ordinal)?
                .map(|v| Value::Number(v.into())),
            ParameterType::Long => row
                .try_get::<Option<i64>, _>(ordinal)?
                .map(|v| Value::Number(v.into())),
            ParameterType::Decimal => row.try_get::<Option<Decimal>, _>(ordinal)?.map(|d| {
                d.to_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(d.to_string()))
            }),
            ParameterType::Double => row
                .try_get::<Option<f64>, _>(ordinal)?
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            ParameterType::Float => row
                .try_get::<Option<f32>, _>(ordinal)?
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(Value::Number),
            ParameterType::String => row
                .try_get::<Option<String>, _>(ordinal)?
                .map(Value::String),
            ParameterType::Bool => row.try_get::<Option<bool>, _>(ordinal)?.map(Value::Bool),
            ParameterType::DateTime => row
                .try_get::<Option<DateTime<Utc>>, _>(ordinal)?
                .map(|v| Value::String(v.to_rfc3339())),
            ParameterType::Guid => row
                .try_get::<Option<uuid::Uuid>, _>(ordinal)?
                .map(|v| Value::String(v.to_string())),
        };

        object.insert(spec.column_name().to_string(), value.unwrap_or(Value::Null));
    }

    Ok(object)
}

/// Executes parameterized SQL against the current tenant's connection.
#[derive(Clone)]
pub struct RawQueryExecutor {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl RawQueryExecutor {
    pub fn new(pool: PgPool, statement_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    /// Execute a SQL template with positional parameters and map every row
    /// to `T` via the declared result columns.
    pub async fn query<T, C>(
        &self,
        schema: &str,
        sql: &str,
        params: &[ParamValue],
        columns: &[C],
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        C: ColumnSpec,
    {
        let rows = self.fetch_rows(schema, sql, params).await?;

        rows.iter()
            .map(|row| {
                let object = row_to_object(row, columns)?;
                serde_json::from_value(Value::Object(object)).map_err(EngineError::from)
            })
            .collect()
    }

    /// Execute a SQL template expected to return at most one row.
    ///
    /// More than one row is a failure, not a silent truncation.
    pub async fn query_single<T, C>(
        &self,
        schema: &str,
        sql: &str,
        params: &[ParamValue],
        columns: &[C],
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        C: ColumnSpec,
    {
        let mut rows: Vec<T> = self.query(schema, sql, params, columns).await?;
        if rows.len() > 1 {
            return Err(EngineError::MoreThanOneRow(format!(
                "expected at most one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }

    async fn fetch_rows(
        &self,
        schema: &str,
        sql: &str,
        params: &[ParamValue],
    ) -> Result<Vec<PgRow>> {
        if sql.trim().is_empty() {
            return Err(EngineError::invalid_parameter("sql must not be empty"));
        }

        let mut conn = acquire_tenant_conn(&self.pool, schema, self.statement_timeout).await?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_param(query, param);
        }

        debug!(schema = %schema, params = params.len(), "executing raw query");

        query
            .fetch_all(conn.as_mut())
            .await
            .map_err(classify_db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_converts_every_type() {
        assert_eq!(
            ParamValue::from_json(ParameterType::Int, &json!("42")).unwrap(),
            ParamValue::Int(42)
        );
        assert_eq!(
            ParamValue::from_json(ParameterType::Long, &json!(1_i64 << 40)).unwrap(),
            ParamValue::Long(1 << 40)
        );
        assert_eq!(
            ParamValue::from_json(ParameterType::Bool, &json!("yes")).unwrap(),
            ParamValue::Bool(true)
        );
        assert_eq!(
            ParamValue::from_json(ParameterType::String, &json!("abc")).unwrap(),
            ParamValue::Text("abc".to_string())
        );
    }

    #[test]
    fn from_json_parses_decimal_guid_datetime() {
        match ParamValue::from_json(ParameterType::Decimal, &json!("19.99")).unwrap() {
            ParamValue::Decimal(d) => assert_eq!(d.to_string(), "19.99"),
            other => panic!("expected decimal, got {other:?}"),
        }

        let id = uuid::Uuid::new_v4();
        assert_eq!(
            ParamValue::from_json(ParameterType::Guid, &json!(id.to_string())).unwrap(),
            ParamValue::Guid(id)
        );

        match ParamValue::from_json(ParameterType::DateTime, &json!("2024-01-15T10:30:00Z")).unwrap()
        {
            ParamValue::DateTime(dt) => assert_eq!(dt.to_rfc3339(), "2024-01-15T10:30:00+00:00"),
            other => panic!("expected datetime, got {other:?}"),
        }
    }

    #[test]
    fn from_json_null_carries_the_declared_type() {
        assert_eq!(
            ParamValue::from_json(ParameterType::Int, &json!(null)).unwrap(),
            ParamValue::Null(ParameterType::Int)
        );
    }

    #[test]
    fn from_json_rejects_mismatches() {
        assert!(ParamValue::from_json(ParameterType::Int, &json!("abc")).is_err());
        assert!(ParamValue::from_json(ParameterType::Guid, &json!(5)).is_err());
    }
}
