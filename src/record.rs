//! Generic record container used to hydrate rows and documents and to
//! track field changes for update batches.

use crate::catalog::types::Value;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    data: Map<String, JsonValue>,
    original: Map<String, JsonValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record hydrated from storage: it starts clean.
    pub fn from_map(data: Map<String, JsonValue>) -> Self {
        Self {
            original: data.clone(),
            data,
        }
    }

    /// A record built from caller payload: every field counts as changed.
    pub fn from_payload(data: Map<String, JsonValue>) -> Self {
        Self {
            data,
            original: Map::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        let mut segments = path.split('.');
        let mut current = self.data.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn get_value(&self, path: &str) -> Option<Value> {
        self.get(path).map(Value::from_json)
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Sets a value, creating intermediate objects along a dotted path.
    pub fn set(&mut self, path: &str, value: JsonValue) {
        let mut segments: Vec<&str> = path.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };
        let mut current = &mut self.data;
        for segment in segments {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if !entry.is_object() {
                *entry = JsonValue::Object(Map::new());
            }
            let JsonValue::Object(next) = entry else {
                return;
            };
            current = next;
        }
        current.insert(last.to_string(), value);
    }

    pub fn unset(&mut self, field: &str) -> Option<JsonValue> {
        self.data.remove(field)
    }

    pub fn id(&self, id_field: &str) -> Option<Value> {
        self.get_value(id_field).filter(|v| !v.is_null())
    }

    pub fn has_changed(&self) -> bool {
        self.data != self.original
    }

    /// Top-level fields whose value differs from the hydrated state.
    pub fn changed_fields(&self) -> BTreeSet<String> {
        let mut changed: BTreeSet<String> = self
            .data
            .iter()
            .filter(|(k, v)| self.original.get(k.as_str()) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        changed.extend(
            self.original
                .keys()
                .filter(|k| !self.data.contains_key(k.as_str()))
                .cloned(),
        );
        changed
    }

    pub fn mark_clean(&mut self) {
        self.original = self.data.clone();
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, JsonValue> {
        &self.data
    }

    pub fn into_map(self) -> Map<String, JsonValue> {
        self.data
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.data.clone())
    }
}

/// Ordered collection of hydrated records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
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

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn ids(&self, id_field: &str) -> Vec<Value> {
        self.records.iter().filter_map(|r| r.id(id_field)).collect()
    }

    pub fn find(&self, id_field: &str, id: &Value) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.id(id_field).as_ref() == Some(id))
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn retain<F: FnMut(&Record) -> bool>(&mut self, keep: F) {
        self.records.retain(keep);
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.records
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
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}
