//! Live-backend tests. Ignored by default; run with
//! `ASKDB_TEST_POSTGRES=postgres://... ASKDB_TEST_MONGODB=mongodb://.../db cargo test -- --ignored`.

use askdb::db::{BackendKind, ConnectionDescriptor};
use askdb::parser::{Operation, ParsedOperation};
use askdb::{execute, fetch_schema, fetch_stats, parse, test_connection, Dialect, Error, Settings, Value};
use mongodb::bson::doc;
use std::time::Duration;

fn postgres() -> Option<ConnectionDescriptor> {
    let uri = std::env::var("ASKDB_TEST_POSTGRES").ok()?;
    let mut descriptor = ConnectionDescriptor::new("pg-test", BackendKind::Postgres);
    descriptor.connection_uri = Some(uri);
    Some(descriptor)
}

fn mongo() -> Option<ConnectionDescriptor> {
    let uri = std::env::var("ASKDB_TEST_MONGODB").ok()?;
    let mut descriptor = ConnectionDescriptor::new("mongo-test", BackendKind::MongoDb);
    descriptor.database = String::from("askdb_test");
    descriptor.connection_uri = Some(uri);
    Some(descriptor)
}

fn unique(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}_{}_{}", prefix, std::process::id(), nanos)
}

#[test]
fn test_orders_status_text_parses() {
    let text = "var collection = \"orders\"\nvar operation = \"find\"\n*FILTER_START\nbson.M{\"status\": \"active\"}\n*FILTER_END";
    let ParsedOperation::Structured(descriptor) = parse(Dialect::Mongo, text).unwrap() else {
        panic!("expected a structured operation");
    };
    assert_eq!(descriptor.collection, "orders");
    let Operation::Find(find) = descriptor.operation else {
        panic!("expected find");
    };
    assert_eq!(find.filter.get("status"), Some(&Value::from("active")));
    assert_eq!(find.filter.len(), 1);
}

#[tokio::test]
async fn test_unreachable_postgres_is_connection_error() {
    let mut descriptor = ConnectionDescriptor::new("nowhere", BackendKind::Postgres);
    descriptor.host = String::from("127.0.0.1");
    descriptor.port = 1;
    descriptor.ssl_mode = askdb::db::SslMode::Disable;
    let settings = Settings {
        connect_timeout_secs: 2,
        ..Settings::default()
    };

    let err = test_connection(&descriptor, &settings).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {err}");

    let err = fetch_schema(&descriptor, &settings).await.unwrap_err();
    assert!(err.is_connection());
    let err = askdb::fetch_schema_or_empty(&descriptor, &settings).await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
#[ignore = "needs ASKDB_TEST_MONGODB"]
async fn test_mongo_find_returns_only_matching_documents() {
    let Some(descriptor) = mongo() else { return };
    let settings = Settings::default();
    let collection_name = unique("orders");

    let client = mongodb::Client::with_uri_str(descriptor.connection_uri.as_deref().unwrap())
        .await
        .unwrap();
    let collection = client
        .database(&descriptor.mongo_database_name())
        .collection::<mongodb::bson::Document>(&collection_name);
    collection
        .insert_many(
            vec![
                doc! { "status": "active", "total": 10, "addr": { "city": "A" } },
                doc! { "status": "closed", "total": 20 },
                doc! { "status": "active", "total": 30, "ratio": f64::NAN },
            ],
            None,
        )
        .await
        .unwrap();

    let text = format!(
        "var collection = \"{}\"\nvar operation = \"find\"\n*FILTER_START\nbson.M{{\"status\": \"active\"}}\n*FILTER_END\n*SORT_START\nbson.D{{{{\"total\", 1}}}}\n*SORT_END",
        collection_name
    );
    let operation = parse(Dialect::Mongo, &text).unwrap();
    let output = execute(&descriptor, &settings, &operation).await.unwrap();

    assert_eq!(output.row_count(), 2);
    for row in &output.rows {
        assert_eq!(row.get("status"), Some(&Value::from("active")));
    }
    assert_eq!(output.rows[0].get("total"), Some(&Value::Int(10)));
    assert_eq!(output.rows[1].get("ratio"), Some(&Value::from("NaN")));

    // Empty pipeline falls back to match-all with a limit.
    let text = format!(
        "var collection = \"{}\"\nvar operation = \"aggregate\"\n*PIPELINE_START\nmongo.Pipeline{{}}\n*PIPELINE_END",
        collection_name
    );
    let operation = parse(Dialect::Mongo, &text).unwrap();
    let output = execute(&descriptor, &settings, &operation).await.unwrap();
    assert_eq!(output.row_count(), 3);

    let schema = fetch_schema(&descriptor, &settings).await.unwrap();
    let table = schema.table(&collection_name).unwrap();
    assert_eq!(table.columns[0].name, "_id");
    assert!(table.columns[0].primary_key);

    let stats = fetch_stats(&descriptor, &settings).await.unwrap();
    assert!(stats.table_count.unwrap_or_default() >= 1);

    collection.drop(None).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
#[ignore = "needs ASKDB_TEST_POSTGRES"]
async fn test_postgres_schema_and_query() {
    let Some(descriptor) = postgres() else { return };
    let settings = Settings::default();
    let table = unique("askdb_items");

    let setup = format!(
        "CREATE TABLE {t} (id serial PRIMARY KEY, name text NOT NULL, price numeric(10,2), tags text[]); \
         INSERT INTO {t} (name, price, tags) VALUES ('pen', 1.50, ARRAY['a','b']), ('ink', NULL, NULL)",
        t = table
    );
    let (client, connection) =
        tokio_postgres::connect(descriptor.connection_uri.as_deref().unwrap(), tokio_postgres::NoTls)
            .await
            .unwrap();
    tokio::spawn(connection);
    client.batch_execute(&setup).await.unwrap();

    let schema = fetch_schema(&descriptor, &settings).await.unwrap();
    let found = schema.table(&table).unwrap();
    let names: Vec<&str> = found.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "price", "tags"]);
    assert!(found.columns[0].primary_key);
    assert!(!found.columns[1].nullable);

    let operation = parse(
        Dialect::Sql,
        &format!("```sql\nSELECT name, price, tags FROM {} ORDER BY id\n```", table),
    )
    .unwrap();
    let output = execute(&descriptor, &settings, &operation).await.unwrap();
    assert_eq!(output.row_count(), 2);
    assert_eq!(output.rows[0].get("price"), Some(&Value::Float(1.5)));
    assert_eq!(
        output.rows[0].get("tags"),
        Some(&Value::Array(vec![Value::from("a"), Value::from("b")]))
    );
    assert_eq!(output.rows[1].get("price"), Some(&Value::Null));

    client
        .batch_execute(&format!("DROP TABLE {}", table))
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "needs ASKDB_TEST_POSTGRES"]
async fn test_postgres_timeout_cancels_query() {
    let Some(descriptor) = postgres() else { return };
    let settings = Settings {
        query_timeout_secs: 1,
        ..Settings::default()
    };
    let operation = parse(Dialect::Sql, "SELECT pg_sleep(5)").unwrap();

    let started = std::time::Instant::now();
    let err = execute(&descriptor, &settings, &operation).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Execution(askdb::ExecutionError::Timeout(d)) if d == Duration::from_secs(1)
    ));
    assert!(started.elapsed() < Duration::from_secs(5));
}
