//! Map property sets onto schema-shaped rows.
//!
//! Normalization never fails: keys matching no column are dropped, and
//! columns with no matching key get [`Value::Absent`]. Values pass through as
//! text; typing happens in the store.

use tracing::debug;

use crate::properties::PropertySet;
use crate::row::{Row, Value};
use crate::schema::Schema;

/// Produce exactly one cell per schema column. The first property matching a
/// column (case-insensitively) supplies its value.
pub fn normalize(properties: &PropertySet, schema: &Schema) -> Row {
    let mut values = vec![None; schema.len()];
    for (key, value) in properties.iter() {
        match schema.column_index(key) {
            Some(idx) => {
                if values[idx].is_none() {
                    values[idx] = Some(Value::from(value.map(str::to_string)));
                }
            }
            None => debug!(key, "dropping property with no matching column"),
        }
    }
    let cells = schema
        .columns()
        .iter()
        .zip(values)
        .map(|(column, value)| (column.name.clone(), value.unwrap_or(Value::Absent)))
        .collect();
    Row::new(cells)
}

/// Normalize each set independently; output order matches input order.
pub fn normalize_batch(property_sets: &[PropertySet], schema: &Schema) -> Vec<Row> {
    property_sets
        .iter()
        .map(|props| normalize(props, schema))
        .collect()
}
