use jobdb::codec::{decode, load_in_memory, load_into_path};
use jobdb::{normalize, ColumnDef, JobDbError, PropertySet, RecordStore, Row, Schema, Value};
use tempfile::tempdir;

fn schema() -> Schema {
    Schema::define([
        ColumnDef::text("id"),
        ColumnDef::text("formula"),
        ColumnDef::integer("charge"),
        ColumnDef::boolean("complete"),
    ])
    .unwrap()
}

async fn populated() -> RecordStore {
    let store = RecordStore::initialize_in_memory(schema()).unwrap();
    let sets = [
        PropertySet::new().with("id", "ZAO002").with("complete", "false"),
        PropertySet::new()
            .with("id", "ZAO001")
            .with("formula", "ZnSb2O4")
            .with("charge", "-2"),
        // Same identifier twice: history rows are kept.
        PropertySet::new().with("id", "ZAO001").with("complete", "true"),
        PropertySet::new().with("id", "untagged"),
    ];
    let rows = sets.iter().map(|p| normalize(p, store.schema())).collect();
    store.insert_batch(rows).await.unwrap();
    store
}

fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| a.canonical_cmp(b, 0));
    rows
}

#[tokio::test]
async fn load_of_dump_preserves_rows_and_schema() {
    let store = populated().await;
    let text = store.dump().await.unwrap();

    let loaded = load_in_memory(&text, None).await.unwrap();
    assert_eq!(loaded.schema(), store.schema());
    assert_eq!(
        sorted(loaded.rows().await.unwrap()),
        sorted(store.rows().await.unwrap())
    );
    assert_eq!(loaded.dump().await.unwrap(), text);
}

#[tokio::test]
async fn dump_does_not_depend_on_interleaving_of_jobs() {
    let store = populated().await;
    let rows = store.rows().await.unwrap();
    // Appended as ZAO002, ZAO001, ZAO001, untagged; regroup without
    // reordering the two ZAO001 rows.
    let regrouped = vec![
        rows[3].clone(),
        rows[1].clone(),
        rows[0].clone(),
        rows[2].clone(),
    ];

    let other = RecordStore::initialize_in_memory(schema()).unwrap();
    other.insert_batch(regrouped).await.unwrap();
    assert_eq!(other.dump().await.unwrap(), store.dump().await.unwrap());
}

#[tokio::test]
async fn corrections_survive_dump_and_load() {
    let store = RecordStore::initialize_in_memory(Schema::job_default()).unwrap();
    let entries = [
        ("ZnSb2O4", "2026-01-01T00:00:00Z"),
        ("ZnO", "2026-02-01T00:00:00Z"),
    ];
    for (formula, recorded_at) in entries {
        let props = PropertySet::new()
            .with("id", "ZAO001")
            .with("formula", formula)
            .with("recorded_at", recorded_at);
        store.insert(normalize(&props, store.schema())).await.unwrap();
    }
    let latest = store.latest("ZAO001").await.unwrap().unwrap();
    assert_eq!(latest.get("formula"), Some(&Value::from("ZnO")));

    let loaded = load_in_memory(&store.dump().await.unwrap(), None)
        .await
        .unwrap();
    let latest = loaded.latest("ZAO001").await.unwrap().unwrap();
    assert_eq!(latest.get("formula"), Some(&Value::from("ZnO")));
    assert_eq!(
        loaded.history("ZAO001").await.unwrap(),
        store.history("ZAO001").await.unwrap()
    );
}

#[tokio::test]
async fn empty_store_round_trips() {
    let store = RecordStore::initialize_in_memory(schema()).unwrap();
    let text = store.dump().await.unwrap();
    assert_eq!(text.lines().count(), 1);

    let (decoded_schema, rows) = decode(&text).unwrap();
    assert_eq!(decoded_schema, schema());
    assert!(rows.is_empty());
}

#[tokio::test]
async fn load_into_path_replaces_store_and_reopens() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("jobs.sqlite");

    let old = RecordStore::initialize(&db_path, Schema::job_default(), false).unwrap();
    old.close().unwrap();

    let text = populated().await.dump().await.unwrap();
    let loaded = load_into_path(&text, &db_path, None).await.unwrap();
    assert_eq!(loaded.schema(), &schema());
    assert_eq!(loaded.count().await.unwrap(), 4);
    loaded.close().unwrap();

    let reopened = RecordStore::open(&db_path).unwrap();
    assert_eq!(reopened.dump().await.unwrap(), text);
}

#[tokio::test]
async fn bad_dump_leaves_existing_store_untouched() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("jobs.sqlite");
    let text = populated().await.dump().await.unwrap();
    load_into_path(&text, &db_path, None)
        .await
        .unwrap()
        .close()
        .unwrap();

    let mut lines: Vec<&str> = text.lines().collect();
    lines[2] = r#"["ZAO001","ZnSb2O4","minus two",null]"#;
    let broken = lines.join("\n");
    let err = load_into_path(&broken, &db_path, None).await.unwrap_err();
    assert!(matches!(err, JobDbError::SchemaConflict(_)), "{err}");

    let store = RecordStore::open(&db_path).unwrap();
    assert_eq!(store.dump().await.unwrap(), text);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".jobdb-load-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn load_checks_expected_schema() {
    let text = populated().await.dump().await.unwrap();

    let err = load_in_memory(&text, Some(&Schema::job_default()))
        .await
        .unwrap_err();
    assert!(matches!(err, JobDbError::SchemaConflict(_)));

    let store = load_in_memory(&text, Some(&schema())).await.unwrap();
    assert_eq!(store.count().await.unwrap(), 4);
}

#[test]
fn forged_fingerprint_is_rejected() {
    let text = concat!(
        r#"{"format":"jobdb-dump","version":1,"table":"jobs","fingerprint":"x","rows":1,"columns":[{"name":"id","kind":"text"}]}"#,
        "\n"
    );
    let err = decode(text).unwrap_err();
    assert!(matches!(err, JobDbError::SchemaConflict(_)));
}
