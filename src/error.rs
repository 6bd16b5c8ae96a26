//! Error taxonomy shared by the store, the codec and the CLI.

use crate::schema::ColumnKind;

#[derive(Debug, thiserror::Error)]
pub enum JobDbError {
    /// The operation targets an incompatible or malformed schema.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
    /// A row value's kind disagrees with its column.
    #[error("type mismatch in column '{column}': expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: ColumnKind,
        found: String,
    },
    /// A uniqueness or other store-level constraint was violated.
    #[error("integrity error: {0}")]
    Integrity(String),
    /// A property source could not be parsed into key/value pairs.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("task join error: {0}")]
    Join(String),
    /// The store is still held elsewhere (a live clone, or another connection
    /// blocking a checkpoint).
    #[error("store in use: {0}")]
    InUse(String),
}

impl From<rusqlite::Error> for JobDbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, ref message)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let detail = message.clone().unwrap_or_else(|| code.to_string());
                JobDbError::Integrity(detail)
            }
            other => JobDbError::Sqlite(other),
        }
    }
}

impl JobDbError {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SchemaConflict(_) => 2,
            Self::TypeMismatch { .. } | Self::Integrity(_) => 3,
            Self::MalformedInput(_) | Self::Config(_) => 4,
            Self::Io(_)
            | Self::Sqlite(_)
            | Self::Serde(_)
            | Self::Join(_)
            | Self::InUse(_) => 1,
        }
    }
}

pub type Result<T, E = JobDbError> = std::result::Result<T, E>;
