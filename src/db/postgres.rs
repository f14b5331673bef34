use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::TryStreamExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::Row;
use tracing::{debug, warn};

use super::connection::{ConnectionDescriptor, PgPool};
use super::query::StructuredError;
use super::schema::{collect_tables, format_size, Column, ColumnType, Schema, Stats};
use crate::config::Settings;
use crate::error::{Error, ExecutionError, Result};
use crate::sanitize::sanitize;
use crate::value::{Map, Value};

const TABLES_SQL: &str = r#"
    SELECT table_name::text AS name
    FROM information_schema.tables
    WHERE table_schema = $1 AND table_type = 'BASE TABLE'
    ORDER BY table_name
    LIMIT $2
"#;

const COLUMNS_SQL: &str = r#"
    SELECT
        c.column_name::text AS name,
        c.data_type::text AS data_type,
        c.is_nullable = 'YES' AS is_nullable,
        EXISTS (
            SELECT 1
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON kcu.constraint_name = tc.constraint_name
                AND kcu.table_schema = tc.table_schema
                AND kcu.table_name = tc.table_name
            WHERE tc.constraint_type = 'PRIMARY KEY'
                AND tc.table_schema = c.table_schema
                AND tc.table_name = c.table_name
                AND kcu.column_name = c.column_name
        ) AS is_primary_key
    FROM information_schema.columns c
    WHERE c.table_schema = $1 AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

const TABLE_COUNT_SQL: &str = r#"
    SELECT COUNT(*)
    FROM information_schema.tables
    WHERE table_schema = $1 AND table_type = 'BASE TABLE'
"#;

const DATABASE_SIZE_SQL: &str = "SELECT pg_database_size(current_database())";

pub(super) async fn fetch_schema(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
) -> Result<Schema> {
    let pool = PgPool::connect(descriptor, settings).await?;

    let names: Vec<String> = {
        let client = pool.get().await?;
        client
            .query(TABLES_SQL, &[&descriptor.schema, &i64::from(settings.max_tables)])
            .await
            .map_err(|e| Error::Introspection(e.to_string()))?
            .iter()
            .map(|row| row.get("name"))
            .collect()
    };
    debug!(tables = names.len(), schema = %descriptor.schema, "listed tables");

    let pool = &pool;
    let schema = descriptor.schema.as_str();
    let tables = collect_tables(names, settings.introspection_concurrency, move |name| async move {
        fetch_columns(pool, schema, &name).await
    })
    .await;

    Ok(Schema { tables })
}

async fn fetch_columns(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<Column>> {
    let client = pool.get().await?;
    let rows = client
        .query(COLUMNS_SQL, &[&schema, &table])
        .await
        .map_err(|e| Error::Introspection(e.to_string()))?;

    Ok(rows
        .iter()
        .map(|row| {
            let name: String = row.get("name");
            let data_type: String = row.get("data_type");
            Column {
                kind: ColumnType::from_sql_type(&data_type),
                path: name.clone(),
                name,
                data_type,
                nullable: row.get("is_nullable"),
                primary_key: row.get("is_primary_key"),
                fields: vec![],
            }
        })
        .collect())
}

pub(super) async fn fetch_stats(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
) -> Result<Stats> {
    let pool = PgPool::connect(descriptor, settings).await?;
    let client = pool.get().await?;

    let table_count = match client.query_one(TABLE_COUNT_SQL, &[&descriptor.schema]).await {
        Ok(row) => Some(row.get::<_, i64>(0).max(0) as u64),
        Err(e) => {
            warn!(error = %e, "failed to count tables");
            None
        }
    };
    let size = match client.query_one(DATABASE_SIZE_SQL, &[]).await {
        Ok(row) => format_size(row.get::<_, i64>(0).max(0) as u64),
        Err(e) => {
            warn!(error = %e, "failed to read database size");
            Stats::unknown().size
        }
    };

    Ok(Stats { table_count, size })
}

/// Run SQL text as-is and materialize every row.
pub(super) async fn execute(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
    sql: &str,
) -> Result<Vec<Map>> {
    let pool = PgPool::connect(descriptor, settings).await?;
    let client = pool.get().await?;

    let run = async {
        let rows = client
            .query_raw(sql, std::iter::empty::<&str>())
            .await
            .map_err(|e| rejected(&e, sql))?;
        futures::pin_mut!(rows);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await.map_err(|e| rejected(&e, sql))? {
            out.push(decode_row(&row));
        }
        Ok(out)
    };

    let timeout = settings.query_timeout();
    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            pool.cancel(&client).await;
            Err(ExecutionError::Timeout(timeout).into())
        }
    }
}

fn rejected(err: &tokio_postgres::Error, sql: &str) -> Error {
    ExecutionError::Rejected(StructuredError::from_pg_error(err, sql)).into()
}

fn decode_row(row: &Row) -> Map {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = decode_value(row, idx, column.type_());
            (column.name().to_string(), sanitize(value))
        })
        .collect()
}

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

fn get_array<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, f: impl Fn(T) -> Value) -> Option<Value> {
    get::<Vec<Option<T>>>(row, idx).map(|items| {
        Value::Array(
            items
                .into_iter()
                .map(|item| item.map(&f).unwrap_or(Value::Null))
                .collect(),
        )
    })
}

fn decode_value(row: &Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(|v| Value::Int(v.into())),
        Type::INT4 => get::<i32>(row, idx).map(|v| Value::Int(v.into())),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int),
        Type::OID => get::<u32>(row, idx).map(|v| Value::Int(v.into())),
        Type::FLOAT4 => get::<f32>(row, idx).map(|v| Value::Float(v.into())),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float),
        Type::NUMERIC => get::<PgNumeric>(row, idx).map(|n| Value::Float(n.0)),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::BPCHAR => {
            get::<String>(row, idx).map(Value::String)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(|b| decode_bytes(&b)),
        Type::UUID => get::<uuid::Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, idx)
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => {
            get::<DateTime<Utc>>(row, idx).map(|dt| Value::String(dt.to_rfc3339()))
        }
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::from),
        Type::BOOL_ARRAY => get_array::<bool>(row, idx, Value::Bool),
        Type::INT2_ARRAY => get_array::<i16>(row, idx, |v| Value::Int(v.into())),
        Type::INT4_ARRAY => get_array::<i32>(row, idx, |v| Value::Int(v.into())),
        Type::INT8_ARRAY => get_array::<i64>(row, idx, Value::Int),
        Type::FLOAT4_ARRAY => get_array::<f32>(row, idx, |v| Value::Float(v.into())),
        Type::FLOAT8_ARRAY => get_array::<f64>(row, idx, Value::Float),
        Type::NUMERIC_ARRAY => get_array::<PgNumeric>(row, idx, |n| Value::Float(n.0)),
        Type::UUID_ARRAY => get_array::<uuid::Uuid>(row, idx, |u| Value::String(u.to_string())),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::NAME_ARRAY | Type::BPCHAR_ARRAY => {
            get_array::<String>(row, idx, Value::String)
        }
        Type::JSON_ARRAY | Type::JSONB_ARRAY => {
            get_array::<serde_json::Value>(row, idx, Value::from)
        }
        // Enums, domains over text and the like: the binary form is the text.
        _ => get::<RawBytes>(row, idx)
            .map(|b| Value::String(String::from_utf8_lossy(&b.0).into_owned())),
    };
    value.unwrap_or(Value::Null)
}

/// Binary values that hold JSON decode to structure, anything else to text.
fn decode_bytes(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<serde_json::Value>(bytes) {
        Ok(json) => Value::from(json),
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Undecoded wire bytes for any type.
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawBytes(raw.to_vec()))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// PostgreSQL NUMERIC as the nearest f64.
///
/// NaN and the infinities, which `Decimal` cannot hold, are recognised from
/// the sign word of the header; everything else goes through `rust_decimal`.
struct PgNumeric(f64);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        if let Some(special) = special_numeric(raw) {
            return Ok(PgNumeric(special));
        }
        let decimal = Decimal::from_sql(ty, raw)?;
        decimal
            .to_f64()
            .map(PgNumeric)
            .ok_or_else(|| format!("numeric {} out of f64 range", decimal).into())
    }

    fn accepts(ty: &Type) -> bool {
        <Decimal as FromSql>::accepts(ty)
    }
}

/// NaN, +Infinity or -Infinity from a NUMERIC header (ndigits, weight,
/// sign, dscale).
fn special_numeric(raw: &[u8]) -> Option<f64> {
    match raw.get(4..6)? {
        [0xC0, 0x00] => Some(f64::NAN),
        [0xD0, 0x00] => Some(f64::INFINITY),
        [0xF0, 0x00] => Some(f64::NEG_INFINITY),
        _ => None,
    }
}
