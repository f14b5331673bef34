use std::time::Duration;

use crate::db::{BackendKind, StructuredError};

/// Longest excerpt of generated text carried inside a [`ParseError`].
pub const EXCERPT_LIMIT: usize = 200;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend could not be reached or refused the credentials.
    #[error("{backend} connection failed: {message}")]
    Connection {
        backend: BackendKind,
        message: String,
    },

    /// Catalog or sampling queries failed after a successful connect.
    #[error("introspection failed: {0}")]
    Introspection(String),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl Error {
    pub fn connection(backend: BackendKind, message: impl std::fmt::Display) -> Self {
        Error::Connection {
            backend,
            message: message.to_string(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("generated text is empty")]
    Empty,

    #[error("missing collection name in generated text: {excerpt}")]
    MissingCollection { excerpt: String },

    #[error("missing operation type in generated text: {excerpt}")]
    MissingOperation { excerpt: String },

    #[error("unsupported operation '{operation}' in generated text: {excerpt}")]
    UnsupportedOperation { operation: String, excerpt: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("query timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("{}", .0.display_full())]
    Rejected(StructuredError),

    #[error("{operation} cannot run against a {backend} connection")]
    DialectMismatch {
        backend: BackendKind,
        operation: &'static str,
    },
}

/// Cut `text` down to at most [`EXCERPT_LIMIT`] characters, never splitting
/// a UTF-8 sequence.
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_short_text_unchanged() {
        assert_eq!(excerpt("  var x = 1 "), "var x = 1");
    }

    #[test]
    fn test_excerpt_truncates_on_char_boundary() {
        let text = "é".repeat(EXCERPT_LIMIT + 10);
        let out = excerpt(&text);
        assert!(out.ends_with("..."));
        assert_eq!(out.chars().count(), EXCERPT_LIMIT + 3);
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection(BackendKind::Postgres, "refused");
        assert_eq!(err.to_string(), "PostgreSQL connection failed: refused");
        assert!(err.is_connection());

        let err = Error::from(ExecutionError::Timeout(Duration::from_secs(30)));
        assert_eq!(err.to_string(), "query timed out after 30s");
    }
}
