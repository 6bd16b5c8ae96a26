//! Deterministic JSONL form of the job table.
//!
//! The first line is a header naming the format, the column list and the row
//! count; each following line is one row as a JSON array in column order,
//! with `null` for absent cells. Rows are grouped by the key column in
//! canonical value order; within one key they keep append order, so the
//! correction history of a job survives a load and an unchanged table always
//! dumps to identical bytes.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{JobDbError, Result};
use crate::row::{Row, Value};
use crate::schema::{ColumnDef, ColumnKind, Schema};
use crate::store::{checkpoint_wal, RecordStore, JOBS_TABLE};

pub const DUMP_FORMAT: &str = "jobdb-dump";
pub const DUMP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DumpHeader {
    format: String,
    version: u32,
    table: String,
    fingerprint: String,
    rows: usize,
    columns: Vec<ColumnDef>,
}

/// Encode rows in canonical order. `rows` must match `schema` and be in
/// append order.
pub fn encode(schema: &Schema, mut rows: Vec<Row>) -> Result<String> {
    let key = schema.key_column();
    // Stable: rows sharing a key stay in the order they were appended.
    rows.sort_by(|a, b| a.key_cmp(b, key));

    let header = DumpHeader {
        format: DUMP_FORMAT.to_string(),
        version: DUMP_VERSION,
        table: JOBS_TABLE.to_string(),
        fingerprint: schema.fingerprint(),
        rows: rows.len(),
        columns: schema.columns().to_vec(),
    };
    let mut out = serde_json::to_string(&header).map_err(|e| JobDbError::Serde(e.to_string()))?;
    out.push('\n');
    for row in &rows {
        let line: Vec<serde_json::Value> = row.cells().iter().map(|(_, v)| v.to_json()).collect();
        out.push_str(&serde_json::Value::Array(line).to_string());
        out.push('\n');
    }
    Ok(out)
}

/// Parse a dump back into its schema and rows.
///
/// Anything that does not fit the declared schema is a
/// [`JobDbError::SchemaConflict`]; nothing is dropped or truncated.
pub fn decode(text: &str) -> Result<(Schema, Vec<Row>)> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header_line) = lines
        .next()
        .ok_or_else(|| JobDbError::SchemaConflict("dump is empty".to_string()))?;
    let header: DumpHeader = serde_json::from_str(header_line)
        .map_err(|e| JobDbError::SchemaConflict(format!("invalid dump header: {e}")))?;
    if header.format != DUMP_FORMAT || header.version != DUMP_VERSION {
        return Err(JobDbError::SchemaConflict(format!(
            "unsupported dump format {} v{}",
            header.format, header.version
        )));
    }
    if header.table != JOBS_TABLE {
        return Err(JobDbError::SchemaConflict(format!(
            "dump is for table {:?}, expected {JOBS_TABLE:?}",
            header.table
        )));
    }
    let schema = Schema::define(header.columns)?;
    if schema.fingerprint() != header.fingerprint {
        return Err(JobDbError::SchemaConflict(
            "header fingerprint does not match its column list".to_string(),
        ));
    }

    let mut rows = Vec::with_capacity(header.rows);
    for (idx, line) in lines {
        rows.push(decode_row(&schema, idx + 1, line)?);
    }
    if rows.len() != header.rows {
        return Err(JobDbError::SchemaConflict(format!(
            "header declares {} rows but {} were found",
            header.rows,
            rows.len()
        )));
    }
    Ok((schema, rows))
}

fn decode_row(schema: &Schema, line_no: usize, line: &str) -> Result<Row> {
    let values: Vec<serde_json::Value> = serde_json::from_str(line).map_err(|e| {
        JobDbError::MalformedInput(format!("line {line_no}: row is not a JSON array: {e}"))
    })?;
    if values.len() != schema.len() {
        return Err(JobDbError::SchemaConflict(format!(
            "line {line_no}: expected {} values, found {}",
            schema.len(),
            values.len()
        )));
    }
    let mut cells = Vec::with_capacity(values.len());
    for (column, json) in schema.columns().iter().zip(values) {
        let value = match (column.kind, json) {
            (_, serde_json::Value::Null) => Value::Absent,
            (ColumnKind::Text, serde_json::Value::String(s)) => Value::Text(s),
            (ColumnKind::Boolean, serde_json::Value::Bool(b)) => Value::Boolean(b),
            (ColumnKind::Integer, serde_json::Value::Number(n)) if n.is_i64() => {
                Value::Integer(n.as_i64().unwrap_or_default())
            }
            (kind, other) => {
                return Err(JobDbError::SchemaConflict(format!(
                    "line {line_no}, column {:?}: expected {kind}, found {other}",
                    column.name
                )))
            }
        };
        cells.push((column.name.clone(), value));
    }
    Ok(Row::new(cells))
}

fn check_expected(found: &Schema, expected: Option<&Schema>) -> Result<()> {
    match expected {
        Some(expected) if expected != found => Err(JobDbError::SchemaConflict(format!(
            "dump columns [{}] differ from expected [{}]",
            found.describe(),
            expected.describe()
        ))),
        _ => Ok(()),
    }
}

/// Rebuild an in-memory store from a dump.
pub async fn load_in_memory(text: &str, expected: Option<&Schema>) -> Result<RecordStore> {
    let (schema, rows) = decode(text)?;
    check_expected(&schema, expected)?;
    let store = RecordStore::initialize_in_memory(schema)?;
    store.insert_batch(rows).await?;
    Ok(store)
}

/// Rebuild the store at `path` from a dump.
///
/// The new database is built in a temporary file next to `path` and renamed
/// over it only once every row is in; on any failure the existing store is
/// untouched.
pub async fn load_into_path(
    text: &str,
    path: impl AsRef<Path>,
    expected: Option<&Schema>,
) -> Result<RecordStore> {
    let path = path.as_ref();
    let (schema, rows) = decode(text)?;
    check_expected(&schema, expected)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let staging = tempfile::Builder::new()
        .prefix(".jobdb-load-")
        .suffix(".sqlite")
        .tempfile_in(&dir)?;

    let built = RecordStore::initialize(staging.path(), schema, true)?;
    let count = built.insert_batch(rows).await?;
    built.close()?;
    debug!(rows = count, staging = %staging.path().display(), "staging store built");

    // Nothing committed may live only in the old log once it is removed.
    checkpoint_wal(path)?;
    for sidecar in ["-wal", "-shm"] {
        let mut stale = path.as_os_str().to_owned();
        stale.push(sidecar);
        match std::fs::remove_file(&stale) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    staging.persist(path).map_err(|e| JobDbError::Io(e.error))?;
    info!(rows = count, path = %path.display(), "store rebuilt from dump");
    RecordStore::open(path)
}
