use futures::TryStreamExt;
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::options::{AggregateOptions, FindOptions};
use mongodb::Database;
use tracing::{debug, info, warn};

use super::connection::{BackendKind, ConnectionDescriptor, MongoSession};
use super::query::{ErrorCategory, StructuredError};
use super::schema::{collect_tables, format_size, Column, ColumnType, Schema, Stats};
use crate::config::Settings;
use crate::error::{Error, ExecutionError, Result};
use crate::parser::{AggregateOperation, FindOperation, Operation, OperationDescriptor, Stage};
use crate::sanitize::sanitize;
use crate::value::{Map, Value};

/// Server code for an operation that exceeded `maxTimeMS`.
const MAX_TIME_EXPIRED: i32 = 50;

pub(super) async fn fetch_schema(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
) -> Result<Schema> {
    let session = MongoSession::open(descriptor, settings).await?;
    let result = introspect(&session.database, settings).await;
    session.close().await;
    result
}

async fn introspect(db: &Database, settings: &Settings) -> Result<Schema> {
    let mut names = collection_names(db)
        .await
        .map_err(|e| Error::Introspection(e.to_string()))?;
    names.truncate(settings.max_tables as usize);
    debug!(collections = names.len(), database = %db.name(), "listed collections");

    // A collection that cannot be sampled keeps its entry with no columns.
    let tables = collect_tables(names, settings.introspection_concurrency, |name| async move {
        match db.collection::<Document>(&name).find_one(None, None).await {
            Ok(Some(sample)) => Ok(infer_columns(&sample, "")),
            Ok(None) => Ok(vec![]),
            Err(e) => {
                warn!(collection = %name, error = %e, "failed to sample collection");
                Ok(vec![])
            }
        }
    })
    .await;

    Ok(Schema { tables })
}

async fn collection_names(db: &Database) -> mongodb::error::Result<Vec<String>> {
    Ok(db
        .list_collection_names(None)
        .await?
        .into_iter()
        .filter(|name| !name.starts_with("system."))
        .collect())
}

/// Derive columns from one sample document.
///
/// `_id` is always the non-nullable primary key. Nested documents and the
/// first element of arrays of documents contribute child fields whose paths
/// are dotted from the root.
pub fn infer_columns(document: &Document, parent: &str) -> Vec<Column> {
    document
        .iter()
        .map(|(key, value)| infer_column(key, value, parent))
        .collect()
}

fn infer_column(key: &str, value: &Bson, parent: &str) -> Column {
    let path = if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    };

    if key == "_id" {
        return Column {
            name: key.to_string(),
            data_type: ColumnType::ObjectId.as_str().to_string(),
            kind: ColumnType::ObjectId,
            nullable: false,
            primary_key: true,
            path,
            fields: vec![],
        };
    }

    let (kind, fields) = match value {
        Bson::Document(inner) => (ColumnType::Object, infer_columns(inner, &path)),
        Bson::Array(items) => match items.first() {
            Some(Bson::Document(inner)) => (ColumnType::Array, infer_columns(inner, &path)),
            _ => (ColumnType::Array, vec![]),
        },
        other => (bson_kind(other), vec![]),
    };

    Column {
        name: key.to_string(),
        data_type: kind.as_str().to_string(),
        kind,
        nullable: true,
        primary_key: false,
        path,
        fields,
    }
}

fn bson_kind(value: &Bson) -> ColumnType {
    match value {
        Bson::String(_) | Bson::Symbol(_) => ColumnType::String,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => {
            ColumnType::Number
        }
        Bson::Boolean(_) => ColumnType::Boolean,
        Bson::DateTime(_) | Bson::Timestamp(_) => ColumnType::Date,
        Bson::ObjectId(_) => ColumnType::ObjectId,
        Bson::Array(_) => ColumnType::Array,
        Bson::Document(_) => ColumnType::Object,
        Bson::Null | Bson::Undefined => ColumnType::Null,
        _ => ColumnType::Unknown,
    }
}

pub(super) async fn fetch_stats(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
) -> Result<Stats> {
    let session = MongoSession::open(descriptor, settings).await?;
    let db = &session.database;

    let table_count = match collection_names(db).await {
        Ok(names) => Some(names.len() as u64),
        Err(e) => {
            warn!(error = %e, "failed to list collections");
            None
        }
    };
    let size = match db.run_command(doc! { "dbStats": 1, "scale": 1 }, None).await {
        Ok(stats) => stats
            .get("dataSize")
            .and_then(bson_to_bytes)
            .map(format_size)
            .unwrap_or_else(|| Stats::unknown().size),
        Err(e) => {
            warn!(error = %e, "failed to read database stats");
            Stats::unknown().size
        }
    };

    session.close().await;
    Ok(Stats { table_count, size })
}

/// `dbStats` reports sizes as whichever numeric type fits.
fn bson_to_bytes(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(v) => u64::try_from(*v).ok(),
        Bson::Int64(v) => u64::try_from(*v).ok(),
        Bson::Double(v) if v.is_finite() && *v >= 0.0 => Some(*v as u64),
        _ => None,
    }
}

pub(super) async fn execute(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
    operation: &OperationDescriptor,
) -> Result<Vec<Map>> {
    let session = MongoSession::open(descriptor, settings).await?;

    let timeout = settings.query_timeout();
    let work = run(&session.database, operation, settings);
    let result = match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::Timeout(timeout).into()),
    };

    session.close().await;
    result
}

async fn run(db: &Database, operation: &OperationDescriptor, settings: &Settings) -> Result<Vec<Map>> {
    let collection = db.collection::<Document>(&operation.collection);
    let documents: Vec<Document> = match &operation.operation {
        Operation::Find(find) => {
            let cursor = collection
                .find(map_to_document(&find.filter), find_options(find, settings))
                .await
                .map_err(|e| mongo_error(e, settings))?;
            cursor.try_collect().await.map_err(|e| mongo_error(e, settings))?
        }
        Operation::Aggregate(aggregate) => {
            let mut options = AggregateOptions::default();
            options.max_time = Some(settings.query_timeout());
            let pipeline = effective_pipeline(aggregate, settings.default_pipeline_limit);
            let cursor = collection
                .aggregate(pipeline, options)
                .await
                .map_err(|e| mongo_error(e, settings))?;
            cursor.try_collect().await.map_err(|e| mongo_error(e, settings))?
        }
    };

    Ok(documents
        .into_iter()
        .map(|document| match sanitize(bson_to_value(Bson::Document(document))) {
            Value::Object(map) => map,
            _ => Map::new(),
        })
        .collect())
}

fn find_options(find: &FindOperation, settings: &Settings) -> FindOptions {
    let mut options = FindOptions::default();
    if !find.sort.is_empty() {
        let mut sort = Document::new();
        for key in &find.sort {
            sort.insert(key.field.clone(), i32::from(key.direction));
        }
        options.sort = Some(sort);
    }
    if !find.projection.is_empty() {
        let mut projection = Document::new();
        for field in &find.projection {
            projection.insert(field.field.clone(), i32::from(field.include));
        }
        options.projection = Some(projection);
    }
    options.limit = find
        .limit
        .filter(|limit| *limit > 0)
        .map(|limit| i64::try_from(limit).unwrap_or(i64::MAX));
    options.max_time = Some(settings.query_timeout());
    options
}

/// Stages to send. An empty pipeline becomes match-all plus a row cap so
/// an unbounded collection scan never reaches the caller.
pub fn effective_pipeline(aggregate: &AggregateOperation, default_limit: i64) -> Vec<Document> {
    if aggregate.pipeline.is_empty() {
        info!(limit = default_limit, "empty pipeline, using default match-all stages");
        return vec![doc! { "$match": {} }, doc! { "$limit": default_limit }];
    }
    aggregate.pipeline.iter().map(stage_to_document).collect()
}

fn stage_to_document(stage: &Stage) -> Document {
    let mut document = Document::new();
    document.insert(stage.operator.clone(), value_to_bson(&stage.argument));
    document
}

fn mongo_error(err: mongodb::error::Error, settings: &Settings) -> Error {
    if let mongodb::error::ErrorKind::Command(cmd) = err.kind.as_ref() {
        if cmd.code == MAX_TIME_EXPIRED {
            return ExecutionError::Timeout(settings.query_timeout()).into();
        }
    }
    let structured = StructuredError::from_mongo_error(&err);
    if structured.category == ErrorCategory::Connection {
        return Error::connection(BackendKind::MongoDb, err);
    }
    ExecutionError::Rejected(structured).into()
}

pub fn map_to_document(map: &Map) -> Document {
    let mut document = Document::new();
    for (key, value) in map.iter() {
        document.insert(key, value_to_bson(value));
    }
    document
}

/// Integers narrow to Int32 when they fit. `{"$oid": "<hex>"}` becomes an
/// ObjectId so filters can match on identifiers.
pub fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => i32::try_from(*i)
            .map(Bson::Int32)
            .unwrap_or(Bson::Int64(*i)),
        Value::Float(f) => Bson::Double(*f),
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(oid) = map
                    .get("$oid")
                    .and_then(Value::as_str)
                    .and_then(|hex| ObjectId::parse_str(hex).ok())
                {
                    return Bson::ObjectId(oid);
                }
            }
            Bson::Document(map_to_document(map))
        }
    }
}

pub fn bson_to_value(value: Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Int(i.into()),
        Bson::Int64(i) => Value::Int(i),
        Bson::Double(f) => Value::Float(f),
        Bson::String(s) => Value::String(s),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(s) => Value::String(s),
            Err(_) => Value::Int(dt.timestamp_millis()),
        },
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_value).collect()),
        Bson::Document(document) => Value::Object(
            document
                .into_iter()
                .map(|(key, value)| (key, bson_to_value(value)))
                .collect(),
        ),
        other => {
            let json = other.into_relaxed_extjson();
            if let Some(number) = json
                .get("$numberDecimal")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| s.parse::<f64>().ok())
            {
                return Value::Float(number);
            }
            Value::from(json)
        }
    }
}
