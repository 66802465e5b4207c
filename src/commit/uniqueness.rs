use crate::backend::{Payload, SearchBackend};
use crate::catalog::types::Value;
use crate::criteria::{PaginationSpec, SearchCriteria};
use crate::error::GateError;
use crate::filter::{FilterCondition, FilterGroup};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Offending fields per batch item, keyed by the item's id (or `#index`
/// when it has none).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UniquenessConflictReport {
    entity: String,
    conflicts: BTreeMap<String, BTreeMap<String, JsonValue>>,
}

impl UniquenessConflictReport {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            conflicts: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, subject: &str, field: &str, value: &JsonValue) {
        self.conflicts
            .entry(subject.to_string())
            .or_default()
            .insert(field.to_string(), value.clone());
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.conflicts.contains_key(subject)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &str> {
        self.conflicts.keys().map(String::as_str)
    }

    pub fn fields_of(&self, subject: &str) -> Option<&BTreeMap<String, JsonValue>> {
        self.conflicts.get(subject)
    }
}

impl fmt::Display for UniquenessConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} conflicting '{}' item(s)", self.conflicts.len(), self.entity)?;
        for (i, (subject, fields)) in self.conflicts.iter().enumerate() {
            f.write_str(if i == 0 { ": " } else { "; " })?;
            write!(f, "{subject} (")?;
            for (j, (field, value)) in fields.iter().enumerate() {
                if j > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{field}={value}")?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Checks a batch against declared unique fields before anything is written.
pub struct UniquenessValidator<'a, B> {
    backend: &'a B,
}

impl<'a, B: SearchBackend> UniquenessValidator<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// `identity_field` tells a stored record that *is* the batch item apart
    /// from a real duplicate: the id for creates and updates, the batch key
    /// for upserts.
    pub async fn validate(&self, items: &[Payload], identity_field: &str) -> Result<(), GateError> {
        let entity = self.backend.entity();
        if entity.unique_fields.is_empty() || items.is_empty() {
            return Ok(());
        }
        let subjects: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(idx, item)| subject_of(item, identity_field, idx))
            .collect();
        let mut report = UniquenessConflictReport::new(&entity.name);

        // Duplicates inside the batch itself.
        for field in &entity.unique_fields {
            let mut first_seen: BTreeMap<Vec<Value>, usize> = BTreeMap::new();
            for (idx, item) in items.iter().enumerate() {
                let Some(value) = present(item, field) else {
                    continue;
                };
                let mut key = vec![Value::from_json(value)];
                key.extend(
                    entity
                        .uniqueness_scope_fields
                        .iter()
                        .map(|s| item.get(s).map(Value::from_json).unwrap_or(Value::Null)),
                );
                match first_seen.get(&key) {
                    Some(&other) => {
                        report.record(&subjects[other], field, value);
                        report.record(&subjects[idx], field, value);
                    }
                    None => {
                        first_seen.insert(key, idx);
                    }
                }
            }
        }

        // One existence query covering every unique field value.
        let mut conditions = Vec::with_capacity(entity.unique_fields.len());
        for field in &entity.unique_fields {
            let mut values: Vec<Value> = items
                .iter()
                .filter_map(|item| present(item, field))
                .map(Value::from_json)
                .collect();
            values.sort();
            values.dedup();
            if !values.is_empty() {
                conditions.push(FilterCondition::in_list(field.clone(), values));
            }
        }
        if !conditions.is_empty() {
            let criteria = SearchCriteria::new()
                .filter(FilterGroup::or(conditions))
                .paginate(PaginationSpec::unbounded());
            let candidates = self.backend.search(&criteria).await?.rows;
            debug!(
                entity = %entity.name,
                items = items.len(),
                candidates = candidates.len(),
                "uniqueness candidates loaded"
            );
            for (idx, item) in items.iter().enumerate() {
                for field in &entity.unique_fields {
                    let Some(value) = present(item, field) else {
                        continue;
                    };
                    let clashes = candidates.iter().any(|candidate| {
                        same(candidate.get(field), Some(value))
                            && entity
                                .uniqueness_scope_fields
                                .iter()
                                .all(|s| same(candidate.get(s), item.get(s)))
                            && !is_self(candidate, item, identity_field)
                    });
                    if clashes {
                        report.record(&subjects[idx], field, value);
                    }
                }
            }
        }

        if report.is_empty() {
            Ok(())
        } else {
            Err(GateError::UniquenessConflict(Box::new(report)))
        }
    }
}

fn subject_of(item: &Payload, identity_field: &str, idx: usize) -> String {
    match present(item, identity_field) {
        Some(id) => Value::from_json(id).to_key_string(),
        None => format!("#{idx}"),
    }
}

fn present<'p>(item: &'p Payload, field: &str) -> Option<&'p JsonValue> {
    item.get(field).filter(|v| !v.is_null())
}

fn same(left: Option<&JsonValue>, right: Option<&JsonValue>) -> bool {
    let norm = |v: Option<&JsonValue>| v.map(Value::from_json).unwrap_or(Value::Null);
    norm(left) == norm(right)
}

fn is_self(candidate: &Payload, item: &Payload, identity_field: &str) -> bool {
    match present(item, identity_field) {
        Some(id) => same(candidate.get(identity_field), Some(id)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::UniquenessConflictReport;
    use serde_json::json;

    #[test]
    fn report_lists_subjects_in_order() {
        let mut report = UniquenessConflictReport::new("product");
        report.record("7", "sku", &json!("A-1"));
        report.record("3", "sku", &json!("A-1"));
        report.record("3", "slug", &json!("oak-desk"));
        assert_eq!(report.subjects().collect::<Vec<_>>(), vec!["3", "7"]);
        assert_eq!(
            report.to_string(),
            "2 conflicting 'product' item(s): 3 (sku=\"A-1\", slug=\"oak-desk\"); 7 (sku=\"A-1\")"
        );
    }
}
