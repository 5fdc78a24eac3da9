use crate::error::QuarryError;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One stored entity: an identity (scalar or composite), its field map, and
/// an optional per-record error for results that could not be fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: Value,
    #[serde(default)]
    pub fields: HashMap<String, Value>,
    #[serde(skip)]
    pub error: Option<Arc<QuarryError>>,
}

impl Default for Record {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl Record {
    pub fn new(id: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
            error: None,
        }
    }

    /// Placeholder for a match whose authoritative copy could not be loaded.
    pub fn with_error(id: impl Into<Value>, error: Arc<QuarryError>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
            error: Some(error),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Like `get`, but resolves `identity_field` to the record identity.
    pub fn lookup(&self, field: &str, identity_field: &str) -> Option<&Value> {
        if field == identity_field {
            Some(&self.id)
        } else {
            self.fields.get(field)
        }
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_i64(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Copy keeping only the named fields; an empty list keeps everything.
    pub fn project(&self, fields: &[String]) -> Record {
        if fields.is_empty() {
            return self.clone();
        }

        Record {
            id: self.id.clone(),
            fields: self
                .fields
                .iter()
                .filter(|(k, _)| fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            error: self.error.clone(),
        }
    }
}

/// Accumulated query output plus the pagination state of the last page seen.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordSet {
    pub records: Vec<Record>,
    pub result_count: u64,
    /// True when `result_count` came from the backend rather than from counting.
    pub known_size: bool,
    pub total_pages: usize,
    pub page: usize,
    pub records_per_page: usize,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self {
            result_count: records.len() as u64,
            records,
            ..Self::default()
        }
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    pub fn ids(&self) -> Vec<Value> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self::from_records(iter.into_iter().collect())
    }
}
