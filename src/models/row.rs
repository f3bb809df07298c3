//! Decoded result rows.

use crate::error::{DbError, DbResult};
use crate::models::value::{FromValue, Value};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

/// Column metadata reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// Database-specific type (e.g., "int8", "options_t", "TEXT")
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// An ordered mapping from column name to [`Value`].
///
/// Rows produced by one statement share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    /// Build a row. `values` must be as long as `columns`.
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a value by column name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .map(|idx| &self.values[idx])
    }

    /// Look up a value by position.
    pub fn value_at(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Decode a column by name into a Rust type.
    pub fn get<T: FromValue>(&self, name: &str) -> DbResult<T> {
        let value = self
            .value(name)
            .ok_or_else(|| DbError::database(format!("Column not found: {}", name), None))?;
        T::from_value(value)
    }

    /// Decode a column by position into a Rust type.
    pub fn get_at<T: FromValue>(&self, idx: usize) -> DbResult<T> {
        let value = self.value_at(idx).ok_or_else(|| {
            DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                idx,
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Iterate over `(column name, value)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.values.iter())
    }

    /// Consume the row, returning the first value.
    pub fn into_first(self) -> Option<Value> {
        self.values.into_iter().next()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Split the row into its shared column list and values.
    pub fn into_parts(self) -> (Arc<[Column]>, Vec<Value>) {
        (self.columns, self.values)
    }

    /// Convert the row to a JSON object keyed by column name.
    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.iter()
            .map(|(name, value)| (name.to_string(), value.to_json()))
            .collect()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value.to_json())?;
        }
        map.end()
    }
}
