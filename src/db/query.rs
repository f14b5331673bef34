use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::connection::{BackendKind, ConnectionDescriptor};
use super::{mongo, postgres};
use crate::config::Settings;
use crate::error::{ExecutionError, Result};
use crate::parser::ParsedOperation;
use crate::value::Map;

/// Categorized error types for query failures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ErrorCategory {
    /// Malformed query text or operators
    Syntax,
    /// Missing table/column/collection, ambiguous reference
    Semantic,
    /// Runtime failures (division by zero, constraint violation, server time limit)
    Execution,
    /// Transaction state errors
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// What the backend said when it rejected an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredError {
    pub category: ErrorCategory,
    /// SQLSTATE for PostgreSQL, numeric server code for MongoDB.
    pub code: String,
    /// MongoDB code name such as `FailedToParse`.
    pub code_name: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    /// 1-based line and column computed from the server's byte position.
    pub line: Option<usize>,
    pub col: Option<usize>,
}

impl StructuredError {
    /// Build from a tokio_postgres error, using the query text to turn the
    /// reported byte position into line/column.
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        let Some(db_err) = err.as_db_error() else {
            let category = if err.source().is_some() {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            return StructuredError {
                category,
                detail: err.source().map(|e| e.to_string()),
                ..Self::from_string(err.to_string())
            };
        };

        let code = db_err.code().code().to_string();
        let position = db_err.position().and_then(|p| match p {
            tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
            tokio_postgres::error::ErrorPosition::Internal { .. } => None,
        });
        let (line, col) = match position {
            Some(pos) => byte_offset_to_line_col(query, pos as usize),
            None => (None, None),
        };

        StructuredError {
            category: categorize_sqlstate(&code),
            code,
            code_name: None,
            message: db_err.message().to_string(),
            detail: db_err.detail().map(str::to_string),
            hint: db_err.hint().map(str::to_string),
            table: db_err.table().map(str::to_string),
            column: db_err.column().map(str::to_string),
            constraint: db_err.constraint().map(str::to_string),
            line,
            col,
        }
    }

    pub fn from_mongo_error(err: &mongodb::error::Error) -> Self {
        use mongodb::error::ErrorKind;

        match err.kind.as_ref() {
            ErrorKind::Command(cmd) => StructuredError {
                category: categorize_mongo_code(cmd.code),
                code: cmd.code.to_string(),
                code_name: Some(cmd.code_name.clone()).filter(|n| !n.is_empty()),
                ..Self::from_string(cmd.message.clone())
            },
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::Authentication { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => StructuredError {
                category: ErrorCategory::Connection,
                ..Self::from_string(err.to_string())
            },
            ErrorKind::InvalidArgument { .. } | ErrorKind::BsonSerialization(_) => {
                StructuredError {
                    category: ErrorCategory::Syntax,
                    ..Self::from_string(err.to_string())
                }
            }
            _ => Self::from_string(err.to_string()),
        }
    }

    pub fn from_string(message: String) -> Self {
        StructuredError {
            category: ErrorCategory::Unknown,
            code: String::new(),
            code_name: None,
            message,
            detail: None,
            hint: None,
            table: None,
            column: None,
            constraint: None,
            line: None,
            col: None,
        }
    }

    /// Rich multi-line rendering.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            lines.push(format!("  at line {}, column {}", line, col));
        }
        match (&self.code_name, self.code.is_empty()) {
            (Some(name), false) => lines.push(format!("  Code: {} ({})", self.code, name)),
            (None, false) => lines.push(format!("  SQLSTATE: {}", self.code)),
            _ => {}
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }
        match (&self.table, &self.column) {
            (Some(table), Some(column)) => lines.push(format!("  Object: {}.{}", table, column)),
            (Some(table), None) => lines.push(format!("  Table: {}", table)),
            _ => {}
        }
        if let Some(constraint) = &self.constraint {
            lines.push(format!("  Constraint: {}", constraint));
        }

        lines.join("\n")
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || query.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    match &code[..2] {
        // 42601 syntax_error; the rest of class 42 is undefined objects and privileges
        "42" if code == "42601" || code == "42000" => ErrorCategory::Syntax,
        "42" => ErrorCategory::Semantic,
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        "25" | "40" => ErrorCategory::Transaction,
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

fn categorize_mongo_code(code: i32) -> ErrorCategory {
    match code {
        // BadValue, FailedToParse, TypeMismatch, unknown operators and stages
        2 | 9 | 14 | 15952 | 16410 | 17287 | 31249 | 40323 | 40324 => ErrorCategory::Syntax,
        // NamespaceNotFound, InvalidNamespace
        26 | 73 => ErrorCategory::Semantic,
        // Unauthorized, AuthenticationFailed
        13 | 18 => ErrorCategory::Connection,
        // NoSuchTransaction, WriteConflict
        251 | 112 => ErrorCategory::Transaction,
        _ => ErrorCategory::Execution,
    }
}

/// Sanitized rows plus how long the operation took.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub rows: Vec<Map>,
    #[serde(serialize_with = "serialize_elapsed")]
    pub elapsed: Duration,
}

fn serialize_elapsed<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_elapsed(*d))
}

impl QueryOutput {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

/// `850µs`, `12.34ms`, `1.50s`.
pub fn format_elapsed(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.2}ms", micros as f64 / 1_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

/// Run a parsed operation against the descriptor's backend.
///
/// SQL text only runs on PostgreSQL and structured operations only on
/// MongoDB. Elapsed time covers connecting, running and materializing.
pub async fn execute(
    descriptor: &ConnectionDescriptor,
    settings: &Settings,
    operation: &ParsedOperation,
) -> Result<QueryOutput> {
    let start = Instant::now();
    let rows = match (descriptor.backend, operation) {
        (BackendKind::Postgres, ParsedOperation::PassThrough(sql)) => {
            postgres::execute(descriptor, settings, sql).await?
        }
        (BackendKind::MongoDb, ParsedOperation::Structured(op)) => {
            mongo::execute(descriptor, settings, op).await?
        }
        (backend, other) => {
            return Err(ExecutionError::DialectMismatch {
                backend,
                operation: other.label(),
            }
            .into())
        }
    };
    let output = QueryOutput {
        rows,
        elapsed: start.elapsed(),
    };
    info!(
        connection = %descriptor.name,
        rows = output.row_count(),
        elapsed = %output.elapsed_display(),
        "query finished"
    );
    debug!(operation = operation.label(), "dispatched");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::parser::{parse, Dialect};

    #[test]
    fn test_structured_error_category_display() {
        assert_eq!(ErrorCategory::Syntax.to_string(), "Syntax Error");
        assert_eq!(ErrorCategory::Semantic.to_string(), "Semantic Error");
        assert_eq!(ErrorCategory::Execution.to_string(), "Execution Error");
        assert_eq!(ErrorCategory::Transaction.to_string(), "Transaction Error");
        assert_eq!(ErrorCategory::Connection.to_string(), "Connection Error");
        assert_eq!(ErrorCategory::Unknown.to_string(), "Error");
    }

    #[test]
    fn test_structured_error_from_string() {
        let err = StructuredError::from_string("test error".into());
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert_eq!(err.message, "test error");
        assert!(err.detail.is_none());
        assert!(err.hint.is_none());
        assert_eq!(err.display_full(), "Error: test error");
    }

    #[test]
    fn test_structured_error_display_full_sql() {
        let err = StructuredError {
            category: ErrorCategory::Syntax,
            code: "42601".to_string(),
            hint: Some("Remove trailing comma.".to_string()),
            line: Some(3),
            col: Some(1),
            ..StructuredError::from_string("syntax error at or near \",\"".to_string())
        };
        let full = err.display_full();
        assert!(full.starts_with("Syntax Error: syntax error"));
        assert!(full.contains("at line 3, column 1"));
        assert!(full.contains("SQLSTATE: 42601"));
        assert!(full.contains("Remove trailing comma"));
    }

    #[test]
    fn test_structured_error_display_full_mongo() {
        let err = StructuredError {
            category: categorize_mongo_code(40324),
            code: "40324".to_string(),
            code_name: Some("Location40324".to_string()),
            ..StructuredError::from_string("Unrecognized pipeline stage name: '$matc'".to_string())
        };
        let full = err.display_full();
        assert!(full.starts_with("Syntax Error"));
        assert!(full.contains("Code: 40324 (Location40324)"));
        assert!(!full.contains("SQLSTATE"));
    }

    #[test]
    fn test_byte_offset_to_line_col() {
        let query = "SELECT *\nFROM users\nWHERE id = 1";
        assert_eq!(byte_offset_to_line_col(query, 1), (Some(1), Some(1)));
        assert_eq!(byte_offset_to_line_col(query, 10), (Some(2), Some(1)));
        assert_eq!(byte_offset_to_line_col(query, 21), (Some(3), Some(1)));
        assert_eq!(byte_offset_to_line_col(query, 0), (Some(1), Some(1)));
    }

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("42703"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("22012"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
        assert_eq!(categorize_sqlstate("4"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_categorize_mongo_code() {
        assert_eq!(categorize_mongo_code(9), ErrorCategory::Syntax);
        assert_eq!(categorize_mongo_code(26), ErrorCategory::Semantic);
        assert_eq!(categorize_mongo_code(13), ErrorCategory::Connection);
        assert_eq!(categorize_mongo_code(50), ErrorCategory::Execution);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_micros(850)), "850µs");
        assert_eq!(format_elapsed(Duration::from_micros(12_340)), "12.34ms");
        assert_eq!(format_elapsed(Duration::from_millis(1_500)), "1.50s");
    }

    #[test]
    fn test_query_output_serializes_elapsed_string() {
        let output = QueryOutput {
            rows: vec![Map::new()],
            elapsed: Duration::from_millis(2),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["elapsed"], "2.00ms");
        assert_eq!(output.row_count(), 1);
    }

    #[tokio::test]
    async fn test_dialect_mismatch_is_rejected_before_connecting() {
        // Unroutable host: the mismatch must be reported without any I/O.
        let mut descriptor = ConnectionDescriptor::new("pg", BackendKind::Postgres);
        descriptor.host = "203.0.113.1".into();
        let op = parse(
            Dialect::Mongo,
            "var collection = \"users\"\nvar operation = \"find\"",
        )
        .unwrap();

        let err = execute(&descriptor, &Settings::default(), &op)
            .await
            .unwrap_err();
        match err {
            Error::Execution(ExecutionError::DialectMismatch { backend, operation }) => {
                assert_eq!(backend, BackendKind::Postgres);
                assert_eq!(operation, "find");
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut descriptor = ConnectionDescriptor::new("m", BackendKind::MongoDb);
        descriptor.host = "203.0.113.1".into();
        let sql = parse(Dialect::Sql, "SELECT 1").unwrap();
        let err = execute(&descriptor, &Settings::default(), &sql)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SQL text cannot run against a MongoDB connection"));
    }
}
