//! Generated text → executable operation.
//!
//! ```text
//! raw provider text
//!       ↓
//! code-fence stripping            (fence.rs)
//!       ↓
//! SQL dialect ──────────────→ ParsedOperation::PassThrough
//! Mongo dialect
//!       ↓
//! assignment lines + sentinel blocks (fence.rs)
//!       ↓
//! literal tokenizer / classifier  (literal.rs)
//!       ↓
//! ParsedOperation::Structured(OperationDescriptor)
//! ```
//!
//! Only a missing collection or operation kind is fatal. Every other
//! malformed piece is logged and left at its empty default.
pub mod fence;
pub mod literal;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::db::BackendKind;
use crate::error::{excerpt, ParseError};
use crate::value::{Map, Value};

/// Target query language of the generated text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Relational: text is executed verbatim.
    Sql,
    /// Document: the sentinel-block mini-language.
    Mongo,
}

impl Dialect {
    pub fn for_backend(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Postgres => Dialect::Sql,
            BackendKind::MongoDb => Dialect::Mongo,
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sql" | "postgres" | "postgresql" => Ok(Dialect::Sql),
            "mongo" | "mongodb" => Ok(Dialect::Mongo),
            other => Err(format!("unknown dialect '{}'", other)),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sql => write!(f, "sql"),
            Dialect::Mongo => write!(f, "mongo"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedOperation {
    PassThrough(String),
    Structured(OperationDescriptor),
}

impl ParsedOperation {
    pub fn label(&self) -> &'static str {
        match self {
            ParsedOperation::PassThrough(_) => "SQL text",
            ParsedOperation::Structured(d) => d.operation.kind().name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationDescriptor {
    pub collection: String,
    #[serde(flatten)]
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Find,
    Aggregate,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Find => "find",
            OperationKind::Aggregate => "aggregate",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "find" => Some(OperationKind::Find),
            "aggregate" => Some(OperationKind::Aggregate),
            _ => None,
        }
    }
}

/// A `find` never carries pipeline stages and an `aggregate` never carries
/// find options; the enum makes the mix unrepresentable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Find(FindOperation),
    Aggregate(AggregateOperation),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Find(_) => OperationKind::Find,
            Operation::Aggregate(_) => OperationKind::Aggregate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FindOperation {
    /// Empty means match everything.
    pub filter: Map,
    pub sort: Vec<SortKey>,
    pub limit: Option<u64>,
    pub projection: Vec<ProjectionField>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AggregateOperation {
    pub pipeline: Vec<Stage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl From<SortDirection> for i32 {
    fn from(d: SortDirection) -> Self {
        match d {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }
}

impl SortDirection {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(1) => Some(SortDirection::Ascending),
            Value::Int(-1) => Some(SortDirection::Descending),
            Value::Float(f) if *f == 1.0 => Some(SortDirection::Ascending),
            Value::Float(f) if *f == -1.0 => Some(SortDirection::Descending),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Some(SortDirection::Ascending),
                "desc" | "descending" => Some(SortDirection::Descending),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionField {
    pub field: String,
    pub include: bool,
}

/// One aggregation stage: a single `operator → argument` mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub operator: String,
    pub argument: Value,
}

/// Parse generated text for the given dialect.
pub fn parse(dialect: Dialect, raw: &str) -> Result<ParsedOperation, ParseError> {
    let body = fence::strip_code_fence(raw);
    if body.is_empty() {
        return Err(ParseError::Empty);
    }

    match dialect {
        Dialect::Sql => Ok(ParsedOperation::PassThrough(body.to_string())),
        Dialect::Mongo => parse_document(body).map(ParsedOperation::Structured),
    }
}

fn parse_document(text: &str) -> Result<OperationDescriptor, ParseError> {
    let collection =
        fence::assignment(text, "collection").ok_or_else(|| ParseError::MissingCollection {
            excerpt: excerpt(text),
        })?;
    let operation_name =
        fence::assignment(text, "operation").ok_or_else(|| ParseError::MissingOperation {
            excerpt: excerpt(text),
        })?;

    let operation = match OperationKind::from_name(&operation_name) {
        Some(OperationKind::Find) => Operation::Find(parse_find(text)),
        Some(OperationKind::Aggregate) => Operation::Aggregate(parse_aggregate(text)),
        None => {
            return Err(ParseError::UnsupportedOperation {
                operation: operation_name,
                excerpt: excerpt(text),
            })
        }
    };

    debug!(collection = %collection, operation = operation.kind().name(), "parsed document operation");
    Ok(OperationDescriptor {
        collection,
        operation,
    })
}

fn parse_find(text: &str) -> FindOperation {
    FindOperation {
        filter: fence::block(text, "FILTER")
            .map(parse_filter)
            .unwrap_or_default(),
        sort: fence::block(text, "SORT")
            .map(parse_sort)
            .unwrap_or_default(),
        limit: fence::block(text, "LIMIT").and_then(parse_limit),
        projection: fence::block(text, "PROJECTION")
            .map(parse_projection)
            .unwrap_or_default(),
    }
}

fn parse_filter(content: &str) -> Map {
    use literal::LiteralKind;

    if content.is_empty() {
        return Map::new();
    }
    match literal::strip_wrapper(content) {
        Some((LiteralKind::Mapping, body)) => literal::parse_mapping(body),
        Some((LiteralKind::PairList, body)) => {
            literal::parse_pair_list(body).into_iter().collect()
        }
        Some((LiteralKind::Sequence, _)) => {
            warn!(block = "FILTER", "filter is a sequence literal, ignoring");
            Map::new()
        }
        // Bare `"key": value` entries without a wrapper.
        None => literal::parse_mapping(content),
    }
}

fn parse_sort(content: &str) -> Vec<SortKey> {
    literal::parse_ordered(content)
        .into_iter()
        .filter_map(|(field, value)| match SortDirection::from_value(&value) {
            Some(direction) => Some(SortKey { field, direction }),
            None => {
                warn!(block = "SORT", field = %field, value = %value, "dropping sort key with invalid direction");
                None
            }
        })
        .collect()
}

fn parse_limit(content: &str) -> Option<u64> {
    if content.is_empty() {
        return None;
    }
    let parsed = literal::parse_value(content)
        .ok()
        .and_then(|v| v.as_i64())
        .and_then(|n| u64::try_from(n).ok());
    if parsed.is_none() {
        warn!(block = "LIMIT", content = %content, "dropping unparsable limit");
    }
    parsed
}

fn parse_projection(content: &str) -> Vec<ProjectionField> {
    literal::parse_ordered(content)
        .into_iter()
        .filter_map(|(field, value)| {
            let include = match value {
                Value::Int(1) | Value::Bool(true) => true,
                Value::Int(0) | Value::Bool(false) => false,
                other => {
                    warn!(block = "PROJECTION", field = %field, value = %other, "dropping projection field");
                    return None;
                }
            };
            Some(ProjectionField { field, include })
        })
        .collect()
}

fn parse_aggregate(text: &str) -> AggregateOperation {
    let Some(content) = fence::block(text, "PIPELINE") else {
        return AggregateOperation::default();
    };

    let body = match literal::strip_wrapper(content) {
        Some((literal::LiteralKind::Sequence, body)) => body,
        _ => content,
    };

    let pipeline = literal::split_top_level(body)
        .into_iter()
        .filter_map(parse_stage)
        .collect();
    AggregateOperation { pipeline }
}

fn parse_stage(text: &str) -> Option<Stage> {
    let parsed = match elided_pair_list(text) {
        Some(pairs) => Ok(Value::Object(pairs.into_iter().collect())),
        None => literal::parse_value(text),
    };
    let value = match parsed {
        Ok(v) => v,
        Err(e) => {
            warn!(block = "PIPELINE", error = %e, "dropping pipeline stage");
            return None;
        }
    };

    match value {
        Value::Object(map) if map.len() == 1 => {
            let (operator, argument) = map.into_iter().next()?;
            Some(Stage { operator, argument })
        }
        other => {
            warn!(block = "PIPELINE", stage = %other, "stage is not a single-key mapping, dropping");
            None
        }
    }
}

/// Inside `mongo.Pipeline{..}` Go lets the element type be elided, so a
/// stage may arrive as `{{"$match", ..}}` with no `bson.D` in front.
fn elided_pair_list(text: &str) -> Option<Vec<(String, Value)>> {
    let body = text.trim().strip_prefix('{')?;
    let body = body.strip_suffix('}').unwrap_or(body);
    let entries = literal::split_top_level(body);
    if entries.is_empty() || !entries.iter().all(|entry| entry.starts_with('{')) {
        return None;
    }
    Some(literal::parse_pair_list(body))
}
