//! Property sets and the sources they are read from.
//!
//! A property set is an insertion-ordered list of key/value pairs with
//! case-insensitive keys. Sources are JSON documents, job documents carrying a
//! property block, or plain `key: value` lines.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{JobDbError, Result};
use crate::schema::fold_key;

static BLOCK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:([^:\s]+):(?:\s+(.*))?$").expect("Invalid property line regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    pairs: Vec<(String, Option<String>)>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`push`](Self::push) for a present value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, Some(value.into()));
        self
    }

    pub fn with_absent(mut self, key: impl Into<String>) -> Self {
        self.push(key, None);
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: Option<String>) {
        self.pairs.push((key.into(), value));
    }

    /// First value whose key matches case-insensitively. `Some(None)` means
    /// the key is present with an absent value.
    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        let key = fold_key(key);
        self.pairs
            .iter()
            .find(|(k, _)| fold_key(k) == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Layer `higher` on top of `self`: keys present in `higher` replace
    /// same-named keys here, everything else is kept.
    pub fn overlay(&self, higher: &PropertySet) -> PropertySet {
        let mut pairs = higher.pairs.clone();
        pairs.extend(
            self.pairs
                .iter()
                .filter(|(k, _)| !higher.contains_key(k))
                .cloned(),
        );
        PropertySet { pairs }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for PropertySet {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }
}

/// Section markers delimiting a property block inside a job document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyMarkers {
    pub marker: String,
    pub end_marker: String,
}

impl Default for PropertyMarkers {
    fn default() -> Self {
        Self {
            marker: ":PROPERTIES:".to_string(),
            end_marker: ":END:".to_string(),
        }
    }
}

/// Parse any supported source into one or more property sets.
///
/// JSON is detected by a leading `{` or `[`; documents by a line equal to the
/// section marker; anything else is read as `key: value` lines.
pub fn parse_source(text: &str, markers: &PropertyMarkers) -> Result<Vec<PropertySet>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_json(text);
    }
    let has_block = text
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case(markers.marker.trim()));
    if has_block {
        return extract_property_blocks(text, markers);
    }
    Ok(vec![parse_key_value_lines(text)?])
}

/// `{...}` is one property set, `[{...}, ...]` a batch. `null` is absent.
pub fn parse_json(text: &str) -> Result<Vec<PropertySet>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| JobDbError::MalformedInput(format!("invalid JSON: {e}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(vec![json_object(map, 0)?]),
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                serde_json::Value::Object(map) => json_object(map, idx),
                other => Err(JobDbError::MalformedInput(format!(
                    "element {idx} is not an object: {other}"
                ))),
            })
            .collect(),
        other => Err(JobDbError::MalformedInput(format!(
            "expected a JSON object or array of objects, found {other}"
        ))),
    }
}

fn json_object(map: serde_json::Map<String, serde_json::Value>, idx: usize) -> Result<PropertySet> {
    let mut props = PropertySet::new();
    for (key, value) in map {
        let value = match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            nested => {
                return Err(JobDbError::MalformedInput(format!(
                    "element {idx}, key {key:?}: nested value {nested} is not a property"
                )))
            }
        };
        props.push(key, value);
    }
    Ok(props)
}

/// Collect every property block of a job document, one set per block.
pub fn extract_property_blocks(text: &str, markers: &PropertyMarkers) -> Result<Vec<PropertySet>> {
    let start = markers.marker.trim();
    let end = markers.end_marker.trim();
    let mut blocks = Vec::new();
    let mut current: Option<(usize, PropertySet)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        match current.take() {
            None => {
                if line.eq_ignore_ascii_case(start) {
                    current = Some((line_no, PropertySet::new()));
                }
            }
            Some((opened, mut props)) => {
                if line.eq_ignore_ascii_case(end) {
                    blocks.push(props);
                } else if line.eq_ignore_ascii_case(start) {
                    return Err(JobDbError::MalformedInput(format!(
                        "line {line_no}: property block opened at line {opened} is not closed"
                    )));
                } else {
                    if !line.is_empty() {
                        let caps = BLOCK_LINE.captures(line).ok_or_else(|| {
                            JobDbError::MalformedInput(format!(
                                "line {line_no}: expected ':KEY: value', found {line:?}"
                            ))
                        })?;
                        let value = caps
                            .get(2)
                            .map(|m| m.as_str().trim())
                            .filter(|v| !v.is_empty())
                            .map(str::to_string);
                        props.push(&caps[1], value);
                    }
                    current = Some((opened, props));
                }
            }
        }
    }

    if let Some((opened, _)) = current {
        return Err(JobDbError::MalformedInput(format!(
            "property block opened at line {opened} has no {end:?} marker"
        )));
    }
    Ok(blocks)
}

/// `key: value` or `key = value` lines; `#` starts a comment line. An empty
/// value is absent.
pub fn parse_key_value_lines(text: &str) -> Result<PropertySet> {
    let mut props = PropertySet::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = split_assignment(line).ok_or_else(|| {
            JobDbError::MalformedInput(format!(
                "line {}: expected 'key: value', found {line:?}",
                idx + 1
            ))
        })?;
        props.push(key, value);
    }
    Ok(props)
}

/// Split at the first `:` or `=`. Returns `None` for a missing separator or key.
pub fn split_assignment(line: &str) -> Option<(String, Option<String>)> {
    let pos = line.find(&[':', '='][..])?;
    let key = line[..pos].trim();
    if key.is_empty() {
        return None;
    }
    let value = line[pos + 1..].trim();
    let value = (!value.is_empty()).then(|| value.to_string());
    Some((key.to_string(), value))
}
