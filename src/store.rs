//! SQLite-backed append-only store for job metadata rows.

use fs2::FileExt;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{JobDbError, Result};
use crate::row::{Row, Value};
use crate::schema::{ColumnDef, ColumnKind, Schema};

/// Table holding one row per insertion event.
pub const JOBS_TABLE: &str = "jobs";
const META_TABLE: &str = "jobdb_meta";
/// Store-managed append sequence; never part of a [`Row`].
const SEQ_COLUMN: &str = "jobdb_seq";
pub const DEFAULT_STORE_FILE: &str = "jobs.sqlite";

// =============================================================================
// Filters
// =============================================================================

/// Row predicate for [`RecordStore::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    All,
    /// Column equals the value, coerced to the column's kind.
    /// `Eq(col, Value::Absent)` matches absent cells.
    Eq(String, Value),
    Present(String),
    Absent(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    pub fn present(column: impl Into<String>) -> Self {
        Self::Present(column.into())
    }

    pub fn absent(column: impl Into<String>) -> Self {
        Self::Absent(column.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordStore {
    path: Option<PathBuf>,
    schema: Arc<Schema>,
    conn: Arc<Mutex<Connection>>,
    /// One blocking operation at a time; the store has a single logical writer.
    sem: Arc<Semaphore>,
}

impl RecordStore {
    /// Create (or verify) the job table at `path`.
    ///
    /// With `destructive` an existing table is dropped and recreated. Without
    /// it, an existing table must carry exactly this schema: a compatible
    /// table is left as is, anything else is a [`JobDbError::SchemaConflict`].
    pub fn initialize(path: impl AsRef<Path>, schema: Schema, destructive: bool) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;
        configure(&conn)?;
        prepare_schema(&mut conn, &schema, destructive)?;
        Ok(Self::from_parts(Some(path.to_path_buf()), schema, conn))
    }

    pub fn initialize_in_memory(schema: Schema) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        prepare_schema(&mut conn, &schema, true)?;
        Ok(Self::from_parts(None, schema, conn))
    }

    /// Attach to a store created by [`initialize`](Self::initialize), taking
    /// the schema from its metadata.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(JobDbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no store at {}; run init-store first", path.display()),
            )));
        }
        let conn = Connection::open(path)?;
        configure(&conn)?;
        let schema = stored_schema(&conn)?.ok_or_else(|| {
            JobDbError::SchemaConflict(format!("{} has no recorded schema", path.display()))
        })?;
        if !table_exists(&conn, JOBS_TABLE)? {
            return Err(JobDbError::SchemaConflict(format!(
                "{} records a schema but has no {JOBS_TABLE} table",
                path.display()
            )));
        }
        Ok(Self::from_parts(Some(path.to_path_buf()), schema, conn))
    }

    /// Fallback store location; environment overrides live in
    /// [`JobDbConfig::store_path`](crate::config::JobDbConfig::store_path).
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_STORE_FILE)
    }

    /// Cross-process exclusive lock for writers, held until the guard drops.
    pub fn lock_exclusive(path: impl AsRef<Path>) -> Result<StoreLock> {
        StoreLock::new(path.as_ref())
    }

    fn from_parts(path: Option<PathBuf>, schema: Schema, conn: Connection) -> Self {
        Self {
            path,
            schema: Arc::new(schema),
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Close the connection, surfacing any error SQLite reports on close.
    /// Fails if a clone of this store is still alive.
    pub fn close(self) -> Result<()> {
        let mutex = Arc::try_unwrap(self.conn)
            .map_err(|_| JobDbError::InUse("cannot close while a clone is alive".to_string()))?;
        let conn = mutex
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conn.close().map_err(|(_, err)| JobDbError::from(err))
    }

    /// Recover from mutex poisoning; the SQLite connection is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut *guard)
    }

    /// Run `f` on the blocking pool, one operation at a time.
    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection, &Schema) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        let _permit = self
            .sem
            .acquire()
            .await
            .map_err(|e| JobDbError::Join(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| f(conn, store.schema.as_ref()))
        })
        .await
        .map_err(|e| JobDbError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub async fn insert(&self, row: Row) -> Result<()> {
        self.run_blocking(move |conn, schema| {
            let values = prepare_row(schema, row)?;
            conn.execute(&insert_sql(schema), params_from_iter(values.iter().map(to_sql)))?;
            Ok(())
        })
        .await
    }

    /// Insert every row or none of them. Returns the number of rows written.
    pub async fn insert_batch(&self, rows: Vec<Row>) -> Result<usize> {
        self.run_blocking(move |conn, schema| {
            let total = rows.len();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(&insert_sql(schema))?;
                for (idx, row) in rows.into_iter().enumerate() {
                    let values = prepare_row(schema, row).map_err(|e| {
                        warn!(row = idx, total, error = %e, "rejecting batch");
                        e
                    })?;
                    stmt.execute(params_from_iter(values.iter().map(to_sql)))?;
                }
            }
            tx.commit()?;
            debug!(rows = total, "batch committed");
            Ok(total)
        })
        .await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Rows matching `filter`, in append order.
    pub async fn query(&self, filter: Filter) -> Result<Vec<Row>> {
        self.run_blocking(move |conn, schema| {
            let mut args = Vec::new();
            let clause = filter_sql(&filter, schema, &mut args)?;
            let sql = format!(
                "SELECT {} FROM {JOBS_TABLE} WHERE {clause} ORDER BY {SEQ_COLUMN}",
                column_list(schema)
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(args.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_from_sql(row, schema)?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn rows(&self) -> Result<Vec<Row>> {
        self.query(Filter::All).await
    }

    /// Every row recorded for an identifier, oldest first.
    pub async fn history(&self, id: &str) -> Result<Vec<Row>> {
        let key = self.schema.key_name().to_string();
        self.query(Filter::eq(key, id)).await
    }

    /// The most recently appended row for an identifier.
    pub async fn latest(&self, id: &str) -> Result<Option<Row>> {
        Ok(self.history(id).await?.pop())
    }

    pub async fn count(&self) -> Result<usize> {
        self.run_blocking(|conn, _| {
            let count: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {JOBS_TABLE}"), [], |row| {
                    row.get(0)
                })?;
            Ok(count.max(0) as usize)
        })
        .await
    }

    /// Deterministic text form of the whole table.
    pub async fn dump(&self) -> Result<String> {
        let rows = self.rows().await?;
        crate::codec::encode(&self.schema, rows)
    }
}

// =============================================================================
// Lock
// =============================================================================

#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn new(db_path: &Path) -> Result<Self> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

// =============================================================================
// Schema management
// =============================================================================

/// Fold any write-ahead log of the database at `path` into the main file and
/// truncate the log, so the main file alone holds every committed row.
pub(crate) fn checkpoint_wal(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let conn = Connection::open(path)?;
    let busy: i64 = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))?;
    if busy != 0 {
        return Err(JobDbError::InUse(format!(
            "{} has active readers; checkpoint incomplete",
            path.display()
        )));
    }
    conn.close().map_err(|(_, err)| JobDbError::from(err))?;
    debug!(path = %path.display(), "checkpointed write-ahead log");
    Ok(())
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\
         PRAGMA synchronous=NORMAL;\
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(())
}

fn prepare_schema(conn: &mut Connection, schema: &Schema, destructive: bool) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (\
           key TEXT PRIMARY KEY,\
           value TEXT NOT NULL\
         );"
    ))?;

    if table_exists(&tx, JOBS_TABLE)? {
        let stored = stored_schema(&tx)?;
        match stored {
            Some(ref existing) if existing == schema && !destructive => {
                debug!(fingerprint = %schema.fingerprint(), "existing table is compatible");
                tx.commit()?;
                return Ok(());
            }
            _ if !destructive => {
                let found = stored
                    .map(|s| s.describe())
                    .unwrap_or_else(|| "an unmanaged table".to_string());
                return Err(JobDbError::SchemaConflict(format!(
                    "table {JOBS_TABLE} exists with [{found}], requested [{}]",
                    schema.describe()
                )));
            }
            _ => {
                info!(table = JOBS_TABLE, "dropping existing table");
                tx.execute_batch(&format!("DROP TABLE {JOBS_TABLE};"))?;
            }
        }
    }

    tx.execute_batch(&create_table_sql(schema))?;
    let columns = serde_json::to_string(schema.columns())
        .map_err(|e| JobDbError::Serde(e.to_string()))?;
    tx.execute(
        &format!(
            "INSERT INTO {META_TABLE} (key, value) VALUES ('schema', ?1), ('fingerprint', ?2)\
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![columns, schema.fingerprint()],
    )?;
    tx.commit()?;
    info!(table = JOBS_TABLE, columns = schema.len(), "initialized job table");
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn stored_schema(conn: &Connection) -> Result<Option<Schema>> {
    if !table_exists(conn, META_TABLE)? {
        return Ok(None);
    }
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {META_TABLE} WHERE key = 'schema'"),
            [],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    let columns: Vec<ColumnDef> = serde_json::from_str(&raw)
        .map_err(|e| JobDbError::SchemaConflict(format!("unreadable stored schema: {e}")))?;
    Schema::define(columns).map(Some)
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn column_list(schema: &Schema) -> String {
    schema
        .columns()
        .iter()
        .map(|c| quote(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql(schema: &Schema) -> String {
    let mut defs = vec![format!("{SEQ_COLUMN} INTEGER PRIMARY KEY AUTOINCREMENT")];
    for column in schema.columns() {
        let mut def = format!("{} {}", quote(&column.name), column.kind.sql_type());
        if column.unique {
            def.push_str(" UNIQUE");
        }
        defs.push(def);
    }
    format!(
        "CREATE TABLE {JOBS_TABLE} ({});\
         CREATE INDEX IF NOT EXISTS idx_{JOBS_TABLE}_key ON {JOBS_TABLE}({}, {SEQ_COLUMN});",
        defs.join(", "),
        quote(schema.key_name())
    )
}

fn insert_sql(schema: &Schema) -> String {
    let placeholders = (1..=schema.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {JOBS_TABLE} ({}) VALUES ({placeholders})",
        column_list(schema)
    )
}

// =============================================================================
// Row conversion
// =============================================================================

/// Check the row has exactly the schema's columns, then coerce each value.
fn prepare_row(schema: &Schema, row: Row) -> Result<Vec<Value>> {
    let same_shape = row.len() == schema.len()
        && row
            .column_names()
            .zip(schema.columns())
            .all(|(name, column)| name.eq_ignore_ascii_case(&column.name));
    if !same_shape {
        let found = row.column_names().collect::<Vec<_>>().join(", ");
        return Err(JobDbError::SchemaConflict(format!(
            "row columns [{found}] do not match schema [{}]",
            schema.describe()
        )));
    }
    row.into_cells()
        .into_iter()
        .zip(schema.columns())
        .map(|((_, value), column)| column.kind.coerce(&column.name, value))
        .collect()
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Absent => SqlValue::Null,
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>, schema: &Schema) -> Result<Row> {
    let mut cells = Vec::with_capacity(schema.len());
    for (idx, column) in schema.columns().iter().enumerate() {
        let raw: SqlValue = row.get(idx)?;
        let value = match (column.kind, raw) {
            (_, SqlValue::Null) => Value::Absent,
            (ColumnKind::Text, SqlValue::Text(s)) => Value::Text(s),
            (ColumnKind::Integer, SqlValue::Integer(n)) => Value::Integer(n),
            (ColumnKind::Boolean, SqlValue::Integer(n)) => Value::Boolean(n != 0),
            (kind, other) => {
                return Err(JobDbError::TypeMismatch {
                    column: column.name.clone(),
                    expected: kind,
                    found: format!("stored {:?}", other.data_type()),
                })
            }
        };
        cells.push((column.name.clone(), value));
    }
    Ok(Row::new(cells))
}

fn filter_sql(filter: &Filter, schema: &Schema, args: &mut Vec<SqlValue>) -> Result<String> {
    let column = |name: &str| {
        schema
            .column_index(name)
            .and_then(|idx| schema.column(idx))
            .ok_or_else(|| JobDbError::SchemaConflict(format!("unknown column {name:?}")))
    };
    Ok(match filter {
        Filter::All => "1".to_string(),
        Filter::Eq(name, value) => {
            let column = column(name)?;
            match column.kind.coerce(&column.name, value.clone())? {
                Value::Absent => format!("{} IS NULL", quote(&column.name)),
                coerced => {
                    args.push(to_sql(&coerced));
                    format!("{} = ?{}", quote(&column.name), args.len())
                }
            }
        }
        Filter::Present(name) => format!("{} IS NOT NULL", quote(&column(name)?.name)),
        Filter::Absent(name) => format!("{} IS NULL", quote(&column(name)?.name)),
        Filter::And(filters) if filters.is_empty() => "1".to_string(),
        Filter::And(filters) => filters
            .iter()
            .map(|f| filter_sql(f, schema, args).map(|sql| format!("({sql})")))
            .collect::<Result<Vec<_>>>()?
            .join(" AND "),
    })
}

// =============================================================================
// Tests
// =============================================================================
