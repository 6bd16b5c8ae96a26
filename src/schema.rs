//! Column definitions for the job table.
//!
//! A [`Schema`] is an explicit value handed to the normalizer and the store.
//! Column names are case-folded once, at definition time, and a lower-cased
//! name → index map is kept next to the ordered column list so lookups never
//! rescan it.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{JobDbError, Result};
use crate::row::Value;

static COLUMN_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("Invalid column name regex"));

/// Prefix reserved for columns the store manages itself.
pub const RESERVED_PREFIX: &str = "jobdb_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Integer,
    Boolean,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "string" => Some(Self::Text),
            "integer" | "int" => Some(Self::Integer),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Physical SQLite type. Booleans are stored as 0/1 integers.
    pub(crate) fn sql_type(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
        }
    }

    /// Convert `value` to this kind, parsing text where the kind allows it.
    ///
    /// Absent stays absent for every kind. A typed value of another kind, or
    /// text that does not parse, is a [`JobDbError::TypeMismatch`].
    pub fn coerce(self, column: &str, value: Value) -> Result<Value> {
        let mismatch = |found: String| JobDbError::TypeMismatch {
            column: column.to_string(),
            expected: self,
            found,
        };
        match (self, value) {
            (_, Value::Absent) => Ok(Value::Absent),
            (Self::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (Self::Integer, Value::Integer(n)) => Ok(Value::Integer(n)),
            (Self::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(b)),
            (Self::Integer, Value::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| mismatch(format!("text {s:?}"))),
            (Self::Boolean, Value::Text(s)) => parse_bool(&s)
                .map(Value::Boolean)
                .ok_or_else(|| mismatch(format!("text {s:?}"))),
            (_, other) => Err(mismatch(other.kind_name().to_string())),
        }
    }
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean spellings accepted from property text, including org-mode `t`/`nil`.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "t" | "1" | "on" => Some(true),
        "false" | "no" | "nil" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    /// Enforce a store-level uniqueness constraint on this column.
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            unique: false,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnDef>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Validate and fold a column list into a schema.
    pub fn define(columns: impl IntoIterator<Item = ColumnDef>) -> Result<Self> {
        let mut folded = Vec::new();
        let mut index = HashMap::new();
        for column in columns {
            let name = fold_key(&column.name);
            if !COLUMN_NAME.is_match(&name) {
                return Err(JobDbError::SchemaConflict(format!(
                    "invalid column name {:?}",
                    column.name
                )));
            }
            if name.starts_with(RESERVED_PREFIX) {
                return Err(JobDbError::SchemaConflict(format!(
                    "column name {name:?} uses the reserved prefix {RESERVED_PREFIX:?}"
                )));
            }
            if index.insert(name.clone(), folded.len()).is_some() {
                return Err(JobDbError::SchemaConflict(format!(
                    "duplicate column {name:?}"
                )));
            }
            folded.push(ColumnDef {
                name,
                kind: column.kind,
                unique: column.unique,
            });
        }
        if folded.is_empty() {
            return Err(JobDbError::SchemaConflict(
                "schema must declare at least one column".to_string(),
            ));
        }
        Ok(Self {
            columns: folded,
            index,
        })
    }

    /// The stock schema for computational chemistry jobs.
    pub fn job_default() -> Self {
        Self::define([
            ColumnDef::text("id"),
            ColumnDef::text("project"),
            ColumnDef::text("run"),
            ColumnDef::text("formula"),
            ColumnDef::text("method"),
            ColumnDef::text("basis"),
            ColumnDef::text("functional"),
            ColumnDef::integer("charge"),
            ColumnDef::integer("multiplicity"),
            ColumnDef::boolean("complete"),
            ColumnDef::text("path"),
            ColumnDef::text("notes"),
            ColumnDef::text("recorded_at"),
        ])
        .expect("default job schema is valid")
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnDef> {
        self.columns.get(idx)
    }

    /// Case-insensitive lookup of a column position.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(&fold_key(name)).copied()
    }

    /// Position of the identifier column: `id` when declared, else the first column.
    pub fn key_column(&self) -> usize {
        self.column_index("id").unwrap_or(0)
    }

    pub fn key_name(&self) -> &str {
        &self.columns[self.key_column()].name
    }

    /// Stable hash of the canonical column list.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (idx, column) in self.columns.iter().enumerate() {
            if idx > 0 {
                hasher.update(b"|");
            }
            hasher.update(column.name.as_bytes());
            hasher.update(b":");
            hasher.update(column.kind.as_str().as_bytes());
            if column.unique {
                hasher.update(b":unique");
            }
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Human-readable column list for error messages.
    pub fn describe(&self) -> String {
        self.columns
            .iter()
            .map(|c| {
                if c.unique {
                    format!("{}:{}:unique", c.name, c.kind)
                } else {
                    format!("{}:{}", c.name, c.kind)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The one key normalization rule: trim and lower-case.
pub fn fold_key(key: &str) -> String {
    key.trim().to_lowercase()
}
