//! Benchmarks for turning generated text into operations.
//!
//! Run with: `cargo bench`

use askdb::parser::literal::{parse_value, split_top_level};
use askdb::{parse, sanitize, Dialect, Map, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

const SQL_FENCED: &str = "Here is the query:\n```sql\nSELECT u.name, COUNT(o.id) \
    FROM users u JOIN orders o ON u.id = o.user_id \
    GROUP BY u.name ORDER BY 2 DESC LIMIT 10;\n```";

const FIND_SIMPLE: &str = r#"var collection = "orders"
var operation = "find"
*FILTER_START
bson.M{"status": "shipped"}
*FILTER_END
*LIMIT_START
10
*LIMIT_END"#;

const FIND_FULL: &str = r#"```go
var collection = "orders"
var operation = "find"
*FILTER_START
bson.M{"status": bson.M{"$in": []string{"shipped", "delivered"}}, "total": bson.M{"$gte": 100.5}, "customer.country": "DE", "flags": bson.A{"a", "b", 3}}
*FILTER_END
*SORT_START
bson.D{{"created_at", -1}, {"total", 1}}
*SORT_END
*LIMIT_START
25
*LIMIT_END
*PROJECTION_START
bson.M{"_id": 0, "status": 1, "total": 1, "customer": 1}
*PROJECTION_END
```"#;

const AGGREGATE: &str = r#"var collection = "orders"
var operation = "aggregate"
*PIPELINE_START
mongo.Pipeline{
    bson.D{{"$match", bson.M{"status": "active", "total": bson.M{"$gt": 0}}}},
    bson.D{{"$group", bson.D{{"_id", "$customer_id"}, {"spent", bson.M{"$sum": "$total"}}, {"orders", bson.M{"$sum": 1}}}}},
    bson.D{{"$sort", bson.D{{"spent", -1}}}},
    bson.M{"$limit": 20},
}
*PIPELINE_END"#;

// ---------------------------------------------------------------------------
// Benchmark groups
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");

    let cases = [
        ("sql_fenced", Dialect::Sql, SQL_FENCED),
        ("find_simple", Dialect::Mongo, FIND_SIMPLE),
        ("find_full", Dialect::Mongo, FIND_FULL),
        ("aggregate", Dialect::Mongo, AGGREGATE),
    ];

    for (name, dialect, text) in &cases {
        group.bench_with_input(BenchmarkId::new("parse", name), text, |b, text| {
            b.iter(|| parse(*dialect, black_box(text)).unwrap());
        });
    }

    group.finish();
}

fn bench_literals(c: &mut Criterion) {
    let mut group = c.benchmark_group("literals");

    let nested = r#"bson.M{"a": bson.M{"b": bson.M{"c": bson.A{1, 2, bson.M{"d": "x, y"}}}}}"#;
    let wide: String = (0..200)
        .map(|i| format!("\"k{}\": {}", i, i))
        .collect::<Vec<_>>()
        .join(", ");
    let wide = format!("bson.M{{{}}}", wide);

    group.bench_function("parse_value_nested", |b| {
        b.iter(|| parse_value(black_box(nested)).unwrap());
    });
    group.bench_function("parse_value_wide", |b| {
        b.iter(|| parse_value(black_box(&wide)).unwrap());
    });
    group.bench_function("split_top_level_wide", |b| {
        let body = &wide["bson.M{".len()..wide.len() - 1];
        b.iter(|| split_top_level(black_box(body)));
    });

    group.finish();
}

fn bench_sanitize(c: &mut Criterion) {
    let mut group = c.benchmark_group("sanitize");

    let rows: Vec<Value> = (0..1_000)
        .map(|i| {
            let mut row = Map::new();
            row.insert("id", Value::Int(i));
            row.insert("ratio", Value::Float(if i % 10 == 0 { f64::NAN } else { i as f64 / 3.0 }));
            row.insert("tags", Value::Array(vec![Value::from("x"), Value::Float(f64::INFINITY)]));
            Value::Object(row)
        })
        .collect();

    group.bench_function("sanitize_1000_rows", |b| {
        b.iter(|| {
            for row in &rows {
                black_box(sanitize(row.clone()));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_literals, bench_sanitize);
criterion_main!(benches);
