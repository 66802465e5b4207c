use crate::backend::{Payload, WriteBackend, WriteReport};
use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::Value;
use crate::commit::uniqueness::UniquenessValidator;
use crate::error::GateError;
use crate::record::{Record, RecordSet};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteBatch {
    pub items: Vec<Payload>,
    /// Natural key upserts match on. Defaults to the entity id field.
    pub key_field: Option<String>,
    /// Trusted input: uniqueness validation is skipped.
    pub direct: bool,
    /// Overwrite fields even when the stored row lists them as locked.
    pub override_locked: bool,
}

impl BulkWriteBatch {
    pub fn new(items: Vec<Payload>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    /// Batch from JSON objects; anything else is an invalid shape.
    pub fn from_json(items: Vec<JsonValue>) -> Result<Self, GateError> {
        let items = items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| match item {
                JsonValue::Object(map) => Ok(map),
                other => Err(GateError::InvalidBatchShape(format!(
                    "item #{idx} is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(items))
    }

    pub fn keyed_by(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    pub fn override_locked(mut self) -> Self {
        self.override_locked = true;
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// How an upsert batch relates to stored rows, decided once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    InsertOnly,
    PatchExisting,
    Mixed,
}

impl WriteIntent {
    pub fn from_counts(existing: usize, total: usize) -> Self {
        if existing == 0 {
            WriteIntent::InsertOnly
        } else if existing >= total {
            WriteIntent::PatchExisting
        } else {
            WriteIntent::Mixed
        }
    }
}

pub struct BulkWriteCoordinator<'a, B> {
    backend: &'a B,
}

impl<'a, B: WriteBackend> BulkWriteCoordinator<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    fn entity(&self) -> &EntityDescriptor {
        self.backend.entity()
    }

    pub async fn bulk_create(&self, batch: BulkWriteBatch) -> Result<RecordSet, GateError> {
        if batch.is_empty() {
            return Err(GateError::EmptyBatch {
                operation: "bulk_create",
            });
        }
        let entity = self.entity();
        for (idx, item) in batch.items.iter().enumerate() {
            let missing: Vec<&str> = entity
                .required_fields
                .iter()
                .filter(|f| item.get(f.as_str()).is_none_or(JsonValue::is_null))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(GateError::InvalidBatchShape(format!(
                    "item #{idx} is missing required fields: {}",
                    missing.join(", ")
                )));
            }
        }
        if !batch.direct {
            UniquenessValidator::new(self.backend)
                .validate(&batch.items, &entity.id_field)
                .await?;
        }
        let report = self.backend.insert(batch.items.clone()).await?;
        Ok(self.reconcile("bulk_create", batch.items, report))
    }

    pub async fn bulk_update(&self, batch: BulkWriteBatch) -> Result<RecordSet, GateError> {
        if batch.is_empty() {
            return Err(GateError::EmptyBatch {
                operation: "bulk_update",
            });
        }
        let entity = self.entity();
        let id_field = entity.id_field.as_str();
        let mut ids = Vec::with_capacity(batch.len());
        for (idx, item) in batch.items.iter().enumerate() {
            match item.get(id_field).filter(|v| !v.is_null()) {
                Some(id) => ids.push(Value::from_json(id)),
                None => {
                    return Err(GateError::InvalidBatchShape(format!(
                        "item #{idx} has no '{id_field}'"
                    )));
                }
            }
        }
        let existing = index_by(self.backend.find_by(id_field, ids.clone()).await?, id_field);
        let unknown: Vec<String> = ids
            .iter()
            .map(Value::to_key_string)
            .filter(|id| !existing.contains_key(id))
            .collect();
        if !unknown.is_empty() {
            return Err(GateError::InvalidBatchShape(format!(
                "unknown '{}' ids: {}",
                entity.name,
                unknown.join(", ")
            )));
        }

        let mut changed = Vec::new();
        let mut changes = Vec::new();
        for (item, id) in batch.items.iter().zip(&ids) {
            let Some(stored) = existing.get(&id.to_key_string()) else {
                continue;
            };
            let fields: Vec<&String> = item.keys().filter(|k| k.as_str() != id_field).collect();
            let record = patch(entity, stored, item, &fields, batch.override_locked);
            if !record.has_changed() {
                debug!(entity = %entity.name, id = %id.to_key_string(), "no changes, skipping");
                continue;
            }
            let delta: Payload = record
                .changed_fields()
                .into_iter()
                .map(|f| {
                    let value = record.as_map().get(&f).cloned().unwrap_or(JsonValue::Null);
                    (f, value)
                })
                .collect();
            changes.push((id.clone(), delta));
            changed.push(record.into_map());
        }
        if changed.is_empty() {
            return Err(GateError::NoChangesDetected {
                entity: entity.name.clone(),
            });
        }
        if !batch.direct {
            UniquenessValidator::new(self.backend)
                .validate(&changed, id_field)
                .await?;
        }
        let report = self.backend.update(changes).await?;
        Ok(self.reconcile("bulk_update", changed, report))
    }

    pub async fn bulk_upsert(&self, batch: BulkWriteBatch) -> Result<RecordSet, GateError> {
        if batch.is_empty() {
            return Err(GateError::EmptyBatch {
                operation: "bulk_upsert",
            });
        }
        let entity = self.entity();
        let key_field = batch
            .key_field
            .clone()
            .unwrap_or_else(|| entity.id_field.clone());
        let mut keys = Vec::with_capacity(batch.len());
        for (idx, item) in batch.items.iter().enumerate() {
            match item.get(&key_field).filter(|v| !v.is_null()) {
                Some(key) => keys.push(Value::from_json(key)),
                None => {
                    return Err(GateError::InvalidBatchShape(format!(
                        "item #{idx} has no '{key_field}'"
                    )));
                }
            }
        }

        let mut union: Vec<String> = Vec::new();
        for item in &batch.items {
            for field in item.keys() {
                if !union.contains(field) {
                    union.push(field.clone());
                }
            }
        }

        let existing = index_by(self.backend.find_by(&key_field, keys.clone()).await?, &key_field);
        let matched = keys
            .iter()
            .filter(|k| existing.contains_key(&k.to_key_string()))
            .count();
        let intent = WriteIntent::from_counts(matched, keys.len());

        let mut update_fields: Vec<String> = union
            .iter()
            .filter(|f| **f != key_field)
            .cloned()
            .collect();
        if intent == WriteIntent::InsertOnly {
            if let Some(locked) = &entity.locked_attributes_field {
                update_fields.retain(|f| f != locked);
            }
        }

        let union_refs: Vec<&String> = union.iter().collect();
        let mut payloads = Vec::with_capacity(batch.len());
        for (item, key) in batch.items.iter().zip(&keys) {
            let payload = match existing.get(&key.to_key_string()) {
                Some(stored) => {
                    let record = patch(entity, stored, item, &union_refs, batch.override_locked);
                    let mut payload: Payload = union
                        .iter()
                        .map(|f| {
                            let value = record.as_map().get(f).cloned().unwrap_or(JsonValue::Null);
                            (f.clone(), value)
                        })
                        .collect();
                    payload.insert(key_field.clone(), key.to_json());
                    if let Some(id) = stored.get(&entity.id_field) {
                        payload.insert(entity.id_field.clone(), id.clone());
                    }
                    payload
                }
                None => item.clone(),
            };
            payloads.push(payload);
        }
        debug!(
            entity = %entity.name,
            items = payloads.len(),
            existing = matched,
            ?intent,
            "upserting batch"
        );

        if !batch.direct {
            UniquenessValidator::new(self.backend)
                .validate(&payloads, &key_field)
                .await?;
        }
        let report = self
            .backend
            .upsert(payloads.clone(), &key_field, update_fields)
            .await?;
        Ok(self.reconcile("bulk_upsert", payloads, report))
    }

    /// Keeps only what the engine confirmed. Dropped items are logged, never
    /// raised.
    fn reconcile(&self, operation: &str, attempted: Vec<Payload>, report: WriteReport) -> RecordSet {
        let id_field = self.entity().id_field.as_str();
        let mut records = RecordSet::default();
        let mut dropped = Vec::new();
        for (idx, mut payload) in attempted.into_iter().enumerate() {
            let outcome = report.items.get(idx);
            if !outcome.is_some_and(|o| o.persisted) {
                dropped.push(
                    payload
                        .get(id_field)
                        .map(|v| Value::from_json(v).to_key_string())
                        .unwrap_or_else(|| format!("#{idx}")),
                );
                continue;
            }
            if let Some(id) = outcome.and_then(|o| o.id.as_ref()) {
                if payload.get(id_field).is_none_or(JsonValue::is_null) {
                    payload.insert(id_field.to_string(), id.to_json());
                }
            }
            records.push(Record::from_map(payload));
        }
        if !dropped.is_empty() {
            warn!(
                entity = %self.entity().name,
                operation,
                dropped = ?dropped,
                "engine did not persist every item"
            );
        }
        records
    }
}

fn index_by(rows: Vec<Payload>, field: &str) -> BTreeMap<String, Payload> {
    rows.into_iter()
        .filter_map(|row| {
            let key = row.get(field).map(|v| Value::from_json(v).to_key_string())?;
            Some((key, row))
        })
        .collect()
}

/// Applies `fields` of `item` over a stored row. Fields named in the row's
/// locked-attributes marker keep their stored value unless overridden; a
/// field absent from the item keeps the stored value too.
fn patch(
    entity: &EntityDescriptor,
    stored: &Payload,
    item: &Payload,
    fields: &[&String],
    override_locked: bool,
) -> Record {
    let locked: BTreeSet<String> = match (&entity.locked_attributes_field, override_locked) {
        (Some(marker), false) => locked_fields(stored.get(marker)),
        _ => BTreeSet::new(),
    };
    let mut record = Record::from_map(stored.clone());
    for field in fields {
        if locked.contains(field.as_str()) {
            continue;
        }
        if let Some(value) = item.get(field.as_str()) {
            record.set(field, value.clone());
        }
    }
    record
}

/// The marker may be stored as a JSON array or as its serialized text.
fn locked_fields(marker: Option<&JsonValue>) -> BTreeSet<String> {
    let parsed;
    let list = match marker {
        Some(JsonValue::String(text)) => {
            parsed = serde_json::from_str::<JsonValue>(text).unwrap_or(JsonValue::Null);
            &parsed
        }
        Some(other) => other,
        None => return BTreeSet::new(),
    };
    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{WriteIntent, locked_fields, patch};
    use crate::catalog::schema::EntityDescriptor;
    use serde_json::json;

    fn obj(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn intent_is_decided_from_counts() {
        assert_eq!(WriteIntent::from_counts(0, 5), WriteIntent::InsertOnly);
        assert_eq!(WriteIntent::from_counts(5, 5), WriteIntent::PatchExisting);
        assert_eq!(WriteIntent::from_counts(3, 5), WriteIntent::Mixed);
    }

    #[test]
    fn locked_marker_parses_array_or_text() {
        assert!(locked_fields(Some(&json!(["name"]))).contains("name"));
        assert!(locked_fields(Some(&json!("[\"price\"]"))).contains("price"));
        assert!(locked_fields(Some(&json!("not json"))).is_empty());
        assert!(locked_fields(None).is_empty());
    }

    #[test]
    fn patch_keeps_locked_and_absent_fields() {
        let entity = EntityDescriptor::new("product", "products")
            .with_locked_attributes_field("locked_attributes");
        let stored = obj(json!({
            "id": 1, "name": "Oak", "price": 10, "locked_attributes": ["name"]
        }));
        let item = obj(json!({"id": 1, "name": "Pine"}));
        let name = "name".to_string();
        let price = "price".to_string();
        let record = patch(&entity, &stored, &item, &[&name, &price], false);
        assert_eq!(record.get("name"), Some(&json!("Oak")));
        assert_eq!(record.get("price"), Some(&json!(10)));
        assert!(!record.has_changed());

        let forced = patch(&entity, &stored, &item, &[&name], true);
        assert_eq!(forced.get("name"), Some(&json!("Pine")));
    }
}
