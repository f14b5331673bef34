mod connection;
mod mongo;
mod postgres;
mod query;
mod schema;

pub use connection::*;
pub use mongo::{bson_to_value, effective_pipeline, infer_columns, value_to_bson};
pub use query::*;
pub use schema::*;
