pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod parser;
pub mod sanitize;
pub mod value;

pub use config::Settings;
pub use db::{
    execute, fetch_schema, fetch_schema_or_empty, fetch_stats, test_connection, BackendKind,
    ConnectionDescriptor, QueryOutput, Schema, Stats,
};
pub use error::{Error, ExecutionError, ParseError, Result};
pub use parser::{parse, Dialect, ParsedOperation};
pub use sanitize::sanitize;
pub use value::{Map, Value};
