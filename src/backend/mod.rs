//! Binds a compiler to an engine. Both backends expose the same read and
//! write surface so collections and the bulk coordinator stay engine-agnostic.

pub mod document;
pub mod relational;

pub use document::DocumentBackend;
pub use relational::RelationalBackend;

use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::Value;
use crate::config::GateConfig;
use crate::criteria::{PaginationSpec, SearchCriteria};
use crate::error::GateError;
use crate::filter::{FilterCondition, FilterGroup};
use crate::results::SearchOutcome;
use serde_json::{Map, Value as JsonValue};

pub type Payload = Map<String, JsonValue>;

pub trait SearchBackend: Send + Sync {
    fn entity(&self) -> &EntityDescriptor;

    fn config(&self) -> &GateConfig;

    fn search(
        &self,
        criteria: &SearchCriteria,
    ) -> impl Future<Output = Result<SearchOutcome, GateError>> + Send;

    /// Every stored row whose `field` is one of `values`.
    fn find_by(
        &self,
        field: &str,
        values: Vec<Value>,
    ) -> impl Future<Output = Result<Vec<Payload>, GateError>> + Send {
        async move {
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let criteria = SearchCriteria::new()
                .filter(FilterGroup::and(vec![FilterCondition::in_list(field, values)]))
                .paginate(PaginationSpec::unbounded());
            Ok(self.search(&criteria).await?.rows)
        }
    }
}

/// Whether one attempted item is stored, and the id the engine assigned to
/// it when the payload carried none.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub persisted: bool,
    pub id: Option<Value>,
}

/// Outcomes aligned with the attempted payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub items: Vec<ItemOutcome>,
}

impl WriteReport {
    pub fn all_persisted(count: usize) -> Self {
        Self {
            items: vec![
                ItemOutcome {
                    persisted: true,
                    id: None,
                };
                count
            ],
        }
    }

    pub fn persisted_count(&self) -> usize {
        self.items.iter().filter(|i| i.persisted).count()
    }
}

pub trait WriteBackend: SearchBackend {
    fn insert(
        &self,
        payloads: Vec<Payload>,
    ) -> impl Future<Output = Result<WriteReport, GateError>> + Send;

    /// Inserts new rows and overwrites `update_fields` of rows whose
    /// `key_field` already exists.
    fn upsert(
        &self,
        payloads: Vec<Payload>,
        key_field: &str,
        update_fields: Vec<String>,
    ) -> impl Future<Output = Result<WriteReport, GateError>> + Send;

    /// Applies per-id field changes.
    fn update(
        &self,
        changes: Vec<(Value, Payload)>,
    ) -> impl Future<Output = Result<WriteReport, GateError>> + Send;

    /// Deletes what the groups match. An empty filter is refused.
    fn delete(
        &self,
        groups: &[FilterGroup],
    ) -> impl Future<Output = Result<u64, GateError>> + Send;
}
