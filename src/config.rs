//! TOML configuration with environment overrides.
//!
//! ```toml
//! store_path = "db/jobs.sqlite"
//!
//! [properties]
//! marker = ":PROPERTIES:"
//! end_marker = ":END:"
//!
//! [[columns]]
//! name = "id"
//! kind = "text"
//! unique = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{JobDbError, Result};
use crate::properties::PropertyMarkers;
use crate::schema::{ColumnDef, ColumnKind, Schema};
use crate::store::RecordStore;

pub const CONFIG_ENV: &str = "JOBDB_CONFIG";
pub const STORE_ENV: &str = "JOBDB_STORE";
pub const DEFAULT_CONFIG_FILE: &str = "jobdb.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobDbConfig {
    pub store_path: Option<PathBuf>,
    pub properties: PropertyMarkers,
    /// Empty means the stock job schema.
    pub columns: Vec<ColumnConfig>,
}

impl JobDbConfig {
    /// `explicit`, else `$JOBDB_CONFIG`, else `./jobdb.toml` when present,
    /// else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => match std::env::var(CONFIG_ENV) {
                Ok(path) if !path.trim().is_empty() => Some(PathBuf::from(path)),
                _ => {
                    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                    local.exists().then_some(local)
                }
            },
        };
        match path {
            Some(path) => {
                debug!(path = %path.display(), "loading configuration");
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    JobDbError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| JobDbError::Config(format!("failed to parse configuration: {e}")))?;
        if config.properties.marker.trim().is_empty() || config.properties.end_marker.trim().is_empty()
        {
            return Err(JobDbError::Config(
                "property markers must be non-empty".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn has_explicit_schema(&self) -> bool {
        !self.columns.is_empty()
    }

    /// The configured schema, or the stock job schema when none is declared.
    pub fn schema(&self) -> Result<Schema> {
        if self.columns.is_empty() {
            return Ok(Schema::job_default());
        }
        let mut columns = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let kind = ColumnKind::from_str(&column.kind).ok_or_else(|| {
                JobDbError::Config(format!(
                    "column {:?} has unknown kind {:?}",
                    column.name, column.kind
                ))
            })?;
            let mut def = ColumnDef::new(column.name.clone(), kind);
            def.unique = column.unique;
            columns.push(def);
        }
        Schema::define(columns)
    }

    /// `flag`, else `$JOBDB_STORE`, else the configured path, else `jobs.sqlite`.
    pub fn store_path(&self, flag: Option<PathBuf>) -> PathBuf {
        if let Some(path) = flag {
            return path;
        }
        if let Ok(path) = std::env::var(STORE_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        self.store_path
            .clone()
            .unwrap_or_else(RecordStore::default_path)
    }
}
