//! Typed cell values and schema-shaped rows.

use std::cmp::Ordering;
use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

/// A cell value. `Absent` is the explicit "unknown / not supplied" marker and
/// is never conflated with an empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Absent,
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) => 2,
            Self::Text(_) => 3,
        }
    }

    /// Total order used for canonical dumps: absent sorts first, then by value.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Integer(a), Self::Integer(b)) => a.cmp(b),
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Absent => serde_json::Value::Null,
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Integer(n) => serde_json::Value::from(*n),
            Self::Boolean(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map_or(Self::Absent, Self::Text)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("<absent>"),
            Self::Text(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Absent => serializer.serialize_none(),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::Boolean(b) => serializer.serialize_bool(*b),
        }
    }
}

/// One job's metadata: a value (or absence marker) per schema column, in
/// schema order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    cells: Vec<(String, Value)>,
}

impl Row {
    pub fn new(cells: Vec<(String, Value)>) -> Self {
        Self { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Case-insensitive lookup by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let column = column.trim();
        self.cells
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn value_at(&self, idx: usize) -> Option<&Value> {
        self.cells.get(idx).map(|(_, value)| value)
    }

    pub fn cells(&self) -> &[(String, Value)] {
        &self.cells
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn into_cells(self) -> Vec<(String, Value)> {
        self.cells
    }

    /// Replace the value of an existing column; unknown columns are ignored.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        if let Some(cell) = self
            .cells
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
        {
            cell.1 = value.into();
        }
        self
    }

    /// Order by the key column alone.
    pub fn key_cmp(&self, other: &Self, key: usize) -> Ordering {
        let absent = Value::Absent;
        let a = self.value_at(key).unwrap_or(&absent);
        let b = other.value_at(key).unwrap_or(&absent);
        a.canonical_cmp(b)
    }

    /// Total order: the key column, then every column in schema order.
    pub fn canonical_cmp(&self, other: &Self, key: usize) -> Ordering {
        self.key_cmp(other, key).then_with(|| {
            self.cells
                .iter()
                .zip(other.cells.iter())
                .map(|((_, x), (_, y))| x.canonical_cmp(y))
                .find(|ord| ord.is_ne())
                .unwrap_or_else(|| self.cells.len().cmp(&other.cells.len()))
        })
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
