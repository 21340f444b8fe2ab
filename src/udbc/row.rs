use crate::error::DbError;
use crate::udbc::deserializer::RowDeserializer;
use crate::udbc::value::Value;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

/// One result row: field names in select-list order mapped to values.
///
/// Rows of the same result set share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Fails when the value count does not match the column count.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Result<Self, DbError> {
        if columns.len() != values.len() {
            return Err(DbError::Value(format!(
                "row has {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self { columns, values })
    }

    /// Builds a row from `(name, value)` pairs, keeping their order.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value whose column is named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    pub(crate) fn values_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.iter().cloned().zip(self.values).collect()
    }

    /// 将行数据映射为目标类型
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, DbError> {
        T::deserialize(RowDeserializer::new(self))
    }
}
