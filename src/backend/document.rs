use crate::backend::{ItemOutcome, Payload, SearchBackend, WriteBackend, WriteReport};
use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::Value;
use crate::config::GateConfig;
use crate::criteria::SearchCriteria;
use crate::document::compiler::{DocumentCompiler, DocumentSearch};
use crate::document::response::ResponseProcessor;
use crate::driver::{BulkOperation, BulkResponse, DocumentStore};
use crate::error::GateError;
use crate::filter::FilterGroup;
use crate::results::SearchOutcome;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::debug;

/// Reads and writes one entity's index through a document store.
pub struct DocumentBackend<S> {
    entity: EntityDescriptor,
    config: GateConfig,
    store: Arc<S>,
}

impl<S: DocumentStore> DocumentBackend<S> {
    pub fn new(entity: EntityDescriptor, config: GateConfig, store: Arc<S>) -> Self {
        Self {
            entity,
            config,
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn compile(&self, criteria: &SearchCriteria) -> Result<DocumentSearch, GateError> {
        DocumentCompiler::new(&self.entity, &self.config).compile(criteria)
    }

    fn document_id(&self, payload: &Payload) -> Option<String> {
        payload
            .get(&self.entity.id_field)
            .filter(|v| !v.is_null())
            .map(|v| Value::from_json(v).to_key_string())
    }

    async fn submit(&self, operations: Vec<BulkOperation>) -> Result<WriteReport, GateError> {
        let attempted = operations.len();
        let response = self
            .store
            .bulk(&self.entity.storage_name, operations)
            .await?;
        debug!(
            index = %self.entity.storage_name,
            attempted,
            errors = response.has_errors(),
            "bulk request finished"
        );
        Ok(report_from(response, attempted))
    }
}

impl<S: DocumentStore> SearchBackend for DocumentBackend<S> {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }

    fn config(&self) -> &GateConfig {
        &self.config
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<SearchOutcome, GateError> {
        let compiled = self.compile(criteria)?;
        let body = compiled.request.to_json();
        debug!(index = %compiled.request.index, body = %body, "document search");
        let raw = self.store.search(&compiled.request.index, &body).await?;
        ResponseProcessor::new(&compiled, &self.entity.id_field).process(&raw)
    }
}

impl<S: DocumentStore> WriteBackend for DocumentBackend<S> {
    async fn insert(&self, payloads: Vec<Payload>) -> Result<WriteReport, GateError> {
        let operations = payloads
            .into_iter()
            .map(|document| BulkOperation::Create {
                id: self.document_id(&document),
                document,
            })
            .collect();
        self.submit(operations).await
    }

    /// Payloads of stored documents only carry the fields being written, so
    /// a partial upsert leaves every other field untouched.
    async fn upsert(
        &self,
        payloads: Vec<Payload>,
        _key_field: &str,
        _update_fields: Vec<String>,
    ) -> Result<WriteReport, GateError> {
        let operations = payloads
            .into_iter()
            .map(|document| match self.document_id(&document) {
                Some(id) => BulkOperation::Upsert { id, document },
                None => BulkOperation::Create { id: None, document },
            })
            .collect();
        self.submit(operations).await
    }

    async fn update(&self, changes: Vec<(Value, Payload)>) -> Result<WriteReport, GateError> {
        let operations = changes
            .into_iter()
            .map(|(id, document)| BulkOperation::Update {
                id: id.to_key_string(),
                document,
            })
            .collect();
        self.submit(operations).await
    }

    async fn delete(&self, groups: &[FilterGroup]) -> Result<u64, GateError> {
        let query = DocumentCompiler::new(&self.entity, &self.config)
            .compile_groups(groups, false)?
            .ok_or_else(|| GateError::FilterNotSpecified {
                entity: self.entity.name.clone(),
            })?;
        let body = json!({ "query": query.to_json() });
        Ok(self
            .store
            .delete_by_query(&self.entity.storage_name, &body)
            .await?)
    }
}

/// Statuses map to attempted items by position; a missing status means the
/// item was not persisted.
fn report_from(response: BulkResponse, attempted: usize) -> WriteReport {
    let mut items: Vec<ItemOutcome> = response
        .items
        .into_iter()
        .take(attempted)
        .map(|status| ItemOutcome {
            persisted: status.is_success(),
            id: status.id.map(|id| Value::from_json(&JsonValue::String(id))),
        })
        .collect();
    items.resize(
        attempted,
        ItemOutcome {
            persisted: false,
            id: None,
        },
    );
    WriteReport { items }
}

#[cfg(test)]
mod tests {
    use super::report_from;
    use crate::driver::{BulkItemStatus, BulkResponse};

    #[test]
    fn short_responses_mark_the_tail_unpersisted() {
        let response = BulkResponse {
            items: vec![
                BulkItemStatus {
                    id: Some("1".into()),
                    status: 201,
                    error: None,
                },
                BulkItemStatus {
                    id: Some("2".into()),
                    status: 409,
                    error: Some("version_conflict".into()),
                },
            ],
        };
        let report = report_from(response, 3);
        let persisted: Vec<bool> = report.items.iter().map(|i| i.persisted).collect();
        assert_eq!(persisted, vec![true, false, false]);
        assert_eq!(report.persisted_count(), 1);
    }
}
