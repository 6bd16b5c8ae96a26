use std::path::Path;
use std::process::{Command, Output, Stdio};

use tempfile::tempdir;

fn jobdb(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jobdb"))
        .args(args)
        .current_dir(cwd)
        .env_remove("JOBDB_CONFIG")
        .env_remove("JOBDB_STORE")
        .env("JOBDB_LOG", "off")
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).unwrap()
}

#[derive(Debug, serde::Deserialize)]
struct QueryRow {
    id: String,
    project: Option<String>,
    run: Option<String>,
    formula: Option<String>,
    charge: Option<i64>,
    complete: Option<bool>,
    recorded_at: Option<String>,
}

#[test]
fn init_insert_query_dump_load() {
    let dir = tempdir().unwrap();
    let cwd = dir.path();
    std::fs::write(
        cwd.join("ZAO001.json"),
        r#"{"Formula":"ZnSb2O4","charge":"-2"}"#,
    )
    .unwrap();
    std::fs::write(cwd.join("notes.txt"), "id: ZAO002\ncomplete: yes\n").unwrap();

    let out = jobdb(cwd, &["init-store"]);
    assert!(out.status.success(), "{out:?}");
    assert!(cwd.join("jobs.sqlite").exists());

    let out = jobdb(cwd, &["insert", "ZAO001.json", "notes.txt"]);
    assert!(out.status.success(), "{out:?}");
    assert!(stdout(&out).contains("inserted 2 rows"));

    let out = jobdb(cwd, &["query", "--id", "ZAO001"]);
    assert!(out.status.success(), "{out:?}");
    let rows: Vec<QueryRow> = stdout(&out)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "ZAO001");
    assert_eq!(rows[0].project.as_deref(), Some("ZAO"));
    assert_eq!(rows[0].run.as_deref(), Some("001"));
    assert_eq!(rows[0].formula.as_deref(), Some("ZnSb2O4"));
    assert_eq!(rows[0].charge, Some(-2));
    assert_eq!(rows[0].complete, None);
    assert!(rows[0].recorded_at.is_some());

    let out = jobdb(cwd, &["query", "--where", "complete=true"]);
    let rows: Vec<QueryRow> = stdout(&out)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "ZAO002");
    assert_eq!(rows[0].complete, Some(true));

    let out = jobdb(cwd, &["dump-store", "jobs.jsonl"]);
    assert!(out.status.success(), "{out:?}");
    let dumped = std::fs::read_to_string(cwd.join("jobs.jsonl")).unwrap();
    assert_eq!(dumped.lines().count(), 3);

    let out = jobdb(cwd, &["--db", "copy.sqlite", "load-store", "jobs.jsonl"]);
    assert!(out.status.success(), "{out:?}");
    let out = jobdb(cwd, &["--db", "copy.sqlite", "dump-store", "-"]);
    assert!(out.status.success(), "{out:?}");
    assert_eq!(stdout(&out), dumped);
}

#[test]
fn schema_conflict_exits_with_two() {
    let dir = tempdir().unwrap();
    let cwd = dir.path();
    assert!(jobdb(cwd, &["init-store"]).status.success());

    std::fs::write(
        cwd.join("narrow.toml"),
        "[[columns]]\nname = \"id\"\nkind = \"text\"\n",
    )
    .unwrap();
    let out = jobdb(cwd, &["--config", "narrow.toml", "init-store"]);
    assert_eq!(out.status.code(), Some(2), "{out:?}");

    let out = jobdb(cwd, &["--config", "narrow.toml", "init-store", "--force"]);
    assert!(out.status.success(), "{out:?}");
}

#[test]
fn type_mismatch_exits_with_three_and_writes_nothing() {
    let dir = tempdir().unwrap();
    let cwd = dir.path();
    assert!(jobdb(cwd, &["init-store"]).status.success());
    std::fs::write(cwd.join("A1.txt"), "charge: 1\n").unwrap();
    std::fs::write(cwd.join("A2.txt"), "charge: neutral\n").unwrap();

    let out = jobdb(cwd, &["insert", "A1.txt", "A2.txt"]);
    assert_eq!(out.status.code(), Some(3), "{out:?}");

    let out = jobdb(cwd, &["query"]);
    assert!(out.status.success());
    assert_eq!(stdout(&out), "");
}

#[test]
fn bad_input_and_missing_store_exit_codes() {
    let dir = tempdir().unwrap();
    let cwd = dir.path();

    let out = jobdb(cwd, &["dump-store", "-"]);
    assert_eq!(out.status.code(), Some(1), "{out:?}");

    assert!(jobdb(cwd, &["init-store"]).status.success());
    std::fs::write(cwd.join("A1.txt"), "formula: H2O\n").unwrap();
    let out = jobdb(cwd, &["insert", "A1.txt", "--set", "no-separator"]);
    assert_eq!(out.status.code(), Some(4), "{out:?}");

    // No identifier from any source and nobody to ask.
    let out = jobdb(cwd, &["insert", "-"]);
    assert_eq!(out.status.code(), Some(4), "{out:?}");

    let out = jobdb(cwd, &["frobnicate"]);
    assert_eq!(out.status.code(), Some(64), "{out:?}");
}

#[test]
fn guessed_identifier_fills_a_custom_key_column() {
    let dir = tempdir().unwrap();
    let cwd = dir.path();
    std::fs::write(
        cwd.join("jobdb.toml"),
        "[[columns]]\nname = \"job\"\nkind = \"text\"\n\n[[columns]]\nname = \"formula\"\nkind = \"text\"\n",
    )
    .unwrap();
    std::fs::write(cwd.join("ZAO007.txt"), "formula: ZnO\n").unwrap();

    assert!(jobdb(cwd, &["init-store"]).status.success());
    let out = jobdb(cwd, &["insert", "ZAO007.txt"]);
    assert!(out.status.success(), "{out:?}");

    let out = jobdb(cwd, &["query", "--id", "ZAO007"]);
    assert!(out.status.success(), "{out:?}");
    let rows: Vec<serde_json::Value> = stdout(&out)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["job"], "ZAO007");
    assert_eq!(rows[0]["formula"], "ZnO");
}
