//! End-to-end scenarios against the public `Database` API, taken verbatim
//! from spec §8's literal test scenarios.

use jify_engine::database::Database;
use jify_engine::index::FieldSpec;
use jify_engine::predicate::{build_predicate, Comparison, Key, Op};
use jify_engine::Error;
use serde_json::json;
use tempfile::tempdir;

#[tokio::test]
async fn john_fixture_equality_returns_one_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.json");
    let database = Database::create(&path).await.unwrap();
    database.insert(&json!({"name": "John", "age": 42})).await.unwrap();
    database.insert(&json!({"name": "John", "age": 17})).await.unwrap();
    database.insert(&json!({"name": "John", "age": 50})).await.unwrap();

    let fields = vec![FieldSpec::new("age", None)];
    let index = database.index(&fields).await.unwrap();

    let predicate = build_predicate(&[Comparison { op: Op::Eq, key: Key::Number(42.0) }]).unwrap();
    let results = database.find(&index, "age", &predicate).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0], json!({"name": "John", "age": 42}));
}

async fn seven_person_fixture() -> (tempfile::TempDir, Database) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("people.json");
    let database = Database::create(&path).await.unwrap();
    for age in [42, 43, 17, 50, 18, 20, 34] {
        database.insert(&json!({"name": "John", "age": age})).await.unwrap();
    }
    (dir, database)
}

#[tokio::test]
async fn half_open_range_over_seven_person_fixture() {
    let (_dir, database) = seven_person_fixture().await;
    let fields = vec![FieldSpec::new("age", None)];
    let index = database.index(&fields).await.unwrap();

    let predicate = build_predicate(&[
        Comparison { op: Op::Ge, key: Key::Number(18.0) },
        Comparison { op: Op::Lt, key: Key::Number(35.0) },
    ])
    .unwrap();
    let mut ages: Vec<i64> =
        database.find(&index, "age", &predicate).await.unwrap().iter().map(|r| r["age"].as_i64().unwrap()).collect();
    ages.sort_unstable();
    assert_eq!(ages, vec![18, 20]);
}

#[tokio::test]
async fn disjoint_queries_over_seven_person_fixture_union_to_four_records() {
    let (_dir, database) = seven_person_fixture().await;
    let fields = vec![FieldSpec::new("age", None)];
    let index = database.index(&fields).await.unwrap();

    use jify_engine::database::FieldQuery;
    let queries = vec![
        vec![FieldQuery {
            field: "age".to_string(),
            kind: None,
            predicate: build_predicate(&[Comparison { op: Op::Lt, key: Key::Number(18.0) }]).unwrap(),
        }],
        vec![FieldQuery {
            field: "age".to_string(),
            kind: None,
            predicate: build_predicate(&[Comparison { op: Op::Gt, key: Key::Number(35.0) }]).unwrap(),
        }],
    ];
    let mut ages: Vec<i64> =
        database.find_queries(&index, &queries).await.unwrap().iter().map(|r| r["age"].as_i64().unwrap()).collect();
    ages.sort_unstable();
    assert_eq!(ages, vec![17, 42, 43, 50]);
}

#[tokio::test]
async fn ten_thousand_unique_ids_each_resolve_to_exactly_one_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.json");
    let database = Database::create(&path).await.unwrap();

    for i in 0..10_000u32 {
        database.insert(&json!({"id": format!("id-{i}")})).await.unwrap();
    }

    let fields = vec![FieldSpec::new("id", None)];
    let index = database.index(&fields).await.unwrap();

    for i in [0u32, 1, 4999, 9998, 9999] {
        let predicate =
            build_predicate(&[Comparison { op: Op::Eq, key: Key::String(format!("id-{i}")) }]).unwrap();
        let results = database.find(&index, "id", &predicate).await.unwrap();
        assert_eq!(results.len(), 1, "id-{i} should resolve to exactly one record");
        assert_eq!(results[0]["id"], format!("id-{i}"));
    }

    // Drop the index file and rebuild from scratch; the same lookups must
    // still resolve identically.
    let index_path = dir.path().join("data.idx.json");
    tokio::fs::remove_file(&index_path).await.unwrap();
    let rebuilt = database.index(&fields).await.unwrap();
    for i in [0u32, 1, 4999, 9998, 9999] {
        let predicate =
            build_predicate(&[Comparison { op: Op::Eq, key: Key::String(format!("id-{i}")) }]).unwrap();
        let results = database.find(&rebuilt, "id", &predicate).await.unwrap();
        assert_eq!(results.len(), 1, "id-{i} should still resolve to exactly one record after rebuild");
    }
}

#[tokio::test]
async fn insert_against_a_file_with_invalid_tail_fails_with_invalid_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    tokio::fs::write(&path, "invalid").await.unwrap();

    let database = Database::open(&path).await.unwrap();
    let err = database.insert(&json!({})).await.unwrap_err();
    assert!(matches!(err, Error::InvalidFormat { .. }));
}

#[tokio::test]
async fn ten_thousand_duplicate_values_are_all_reachable_via_link_chain() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data.json");
    let database = Database::create(&path).await.unwrap();

    for _ in 0..10_000u32 {
        database.insert(&json!({"age": 4})).await.unwrap();
    }

    let fields = vec![FieldSpec::new("age", None)];
    let index = database.index(&fields).await.unwrap();
    let predicate = build_predicate(&[Comparison { op: Op::Eq, key: Key::Number(4.0) }]).unwrap();
    let results = database.find(&index, "age", &predicate).await.unwrap();
    assert_eq!(results.len(), 10_000);
}
