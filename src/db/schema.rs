use futures::{stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::connection::{BackendKind, ConnectionDescriptor};
use super::{mongo, postgres};
use crate::config::Settings;
use crate::error::{Error, Result};

/// Backend-neutral type tag for a column or document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Array,
    Object,
    Null,
    Unknown,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::String => "string",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::ObjectId => "object-id",
            ColumnType::Array => "array",
            ColumnType::Object => "object",
            ColumnType::Null => "null",
            ColumnType::Unknown => "unknown",
        }
    }

    /// Classify an `information_schema.columns.data_type` value.
    pub fn from_sql_type(data_type: &str) -> Self {
        let t = data_type.to_ascii_lowercase();
        if t == "array" || t.ends_with("[]") {
            ColumnType::Array
        } else if t.contains("char") || t == "text" || t == "uuid" || t == "name" || t == "citext" {
            ColumnType::String
        } else if matches!(
            t.as_str(),
            "smallint" | "integer" | "bigint" | "real" | "double precision" | "money" | "oid"
        ) || t.starts_with("numeric")
            || t.starts_with("decimal")
        {
            ColumnType::Number
        } else if t == "boolean" {
            ColumnType::Boolean
        } else if t.starts_with("timestamp") || t == "date" || t.starts_with("time") {
            ColumnType::Date
        } else if t == "json" || t == "jsonb" {
            ColumnType::Object
        } else {
            ColumnType::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    pub name: String,
    /// Declared type name for relational columns, the tag name for documents.
    pub data_type: String,
    pub kind: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    /// Dotted path from the document root; equal to `name` at top level.
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Compact plain-text rendering suitable for prompt context.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&table.name);
            out.push_str(":\n");
            for column in &table.columns {
                describe_column(&mut out, column, 1);
            }
        }
        out
    }
}

fn describe_column(out: &mut String, column: &Column, depth: usize) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&column.path);
    out.push(' ');
    out.push_str(&column.data_type);
    if column.primary_key {
        out.push_str(" PK");
    }
    if !column.nullable {
        out.push_str(" NOT NULL");
    }
    out.push('\n');
    for field in &column.fields {
        describe_column(out, field, depth + 1);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub table_count: Option<u64>,
    /// Human-formatted size, or "Unknown".
    pub size: String,
}

impl Stats {
    pub fn unknown() -> Self {
        Self {
            table_count: None,
            size: String::from("Unknown"),
        }
    }
}

/// Introspect the target's tables or collections.
///
/// Connection failures and a blown introspection deadline are errors; a
/// single table failing only drops that table.
pub async fn fetch_schema(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<Schema> {
    let work = async {
        match descriptor.backend {
            BackendKind::Postgres => postgres::fetch_schema(descriptor, settings).await,
            BackendKind::MongoDb => mongo::fetch_schema(descriptor, settings).await,
        }
    };
    let timeout = settings.introspection_timeout();
    tokio::time::timeout(timeout, work).await.map_err(|_| {
        Error::Introspection(format!("timed out after {}s", timeout.as_secs()))
    })?
}

/// Like [`fetch_schema`] but degrades non-connection failures to an empty
/// schema so generation can continue without context.
pub async fn fetch_schema_or_empty(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
) -> Result<Schema> {
    match fetch_schema(descriptor, settings).await {
        Ok(schema) => Ok(schema),
        Err(e) if e.is_connection() => Err(e),
        Err(e) => {
            warn!(connection = %descriptor.name, error = %e, "schema unavailable, continuing without it");
            Ok(Schema::default())
        }
    }
}

/// Table count and on-disk size. Parts that cannot be read come back as
/// `None` / "Unknown"; only connection failures are errors. A server that
/// stalls past the introspection deadline yields [`Stats::unknown`].
pub async fn fetch_stats(descriptor: &ConnectionDescriptor, settings: &Settings) -> Result<Stats> {
    let work = async {
        match descriptor.backend {
            BackendKind::Postgres => postgres::fetch_stats(descriptor, settings).await,
            BackendKind::MongoDb => mongo::fetch_stats(descriptor, settings).await,
        }
    };
    stats_within(settings.introspection_timeout(), work).await
}

async fn stats_within(timeout: Duration, work: impl Future<Output = Result<Stats>>) -> Result<Stats> {
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "stats timed out");
            Ok(Stats::unknown())
        }
    }
}

/// Fetch columns for every table, at most `concurrency` at a time.
///
/// The result keeps the order of `names`. A table whose fetch fails is
/// logged and left out; its siblings still complete.
pub(crate) async fn collect_tables<F, Fut>(
    names: Vec<String>,
    concurrency: usize,
    fetch: F,
) -> Vec<Table>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<Column>>>,
{
    stream::iter(names)
        .map(|name| {
            let columns = fetch(name.clone());
            async move { (name, columns.await) }
        })
        .buffered(concurrency.max(1))
        .filter_map(|(name, columns)| async move {
            match columns {
                Ok(columns) => Some(Table { name, columns }),
                Err(e) => {
                    warn!(table = %name, error = %e, "skipping table");
                    None
                }
            }
        })
        .collect()
        .await
}

/// Format a byte count with binary units.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    const SUFFIXES: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / UNIT as f64;
    let mut idx = 0;
    while value >= UNIT as f64 && idx < SUFFIXES.len() - 1 {
        value /= UNIT as f64;
        idx += 1;
    }
    format!("{:.2} {}", value, SUFFIXES[idx])
}
