//! Stateful criteria builder over one backend. Accumulated state compiles
//! once per load; any change sends the collection back to unloaded.

use crate::backend::{Payload, SearchBackend, WriteBackend};
use crate::catalog::types::Value;
use crate::commit::bulk::BulkWriteCoordinator;
use crate::criteria::{
    AggregationSpec, CollapseSpec, CriteriaInput, FullTextClause, PaginationSpec, SearchCriteria,
    SortSpec,
};
use crate::error::GateError;
use crate::filter::{FieldFilter, FilterCondition, FilterGroup, FilterGroupBuilder, GroupLogic};
use crate::query::plan::JoinSpec;
use crate::record::{Record, RecordSet};
use crate::results::{AggregationValue, Aggregations};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct Loaded {
    records: RecordSet,
    total: u64,
    aggregations: Aggregations,
}

pub struct Collection<B> {
    backend: Arc<B>,
    filters: FilterGroupBuilder,
    /// Everything but the filter groups, which live in `filters`.
    criteria: SearchCriteria,
    loaded: Option<Loaded>,
}

impl<B: SearchBackend> Collection<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            filters: FilterGroupBuilder::new(),
            criteria: SearchCriteria::new(),
            loaded: None,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn touch(&mut self) -> &mut Self {
        self.loaded = None;
        self
    }

    pub fn add_field_filter(&mut self, field: &str, filter: FieldFilter) -> Result<&mut Self, GateError> {
        self.add_field_filter_with_logic(field, filter, GroupLogic::And)
    }

    /// `logic` decides how the entries of an operator list combine.
    pub fn add_field_filter_with_logic(
        &mut self,
        field: &str,
        filter: FieldFilter,
        logic: GroupLogic,
    ) -> Result<&mut Self, GateError> {
        self.filters.add_field_filter(field, filter, logic)?;
        Ok(self.touch())
    }

    /// Parses the dynamic caller form (scalar, range, operator map or
    /// operator list) before adding it.
    pub fn add_filter_json(
        &mut self,
        field: &str,
        input: &JsonValue,
        logic: GroupLogic,
    ) -> Result<&mut Self, GateError> {
        let lenient = self.backend.config().lenient_unknown_operators;
        let filter = FieldFilter::from_json(field, input, lenient)?;
        self.add_field_filter_with_logic(field, filter, logic)
    }

    pub fn add_condition(&mut self, condition: FilterCondition) -> &mut Self {
        self.filters.add_condition(condition);
        self.touch()
    }

    pub fn add_filter_group(&mut self, group: FilterGroup) -> &mut Self {
        self.filters.add_group(group);
        self.touch()
    }

    pub fn add_post_filter(&mut self, group: FilterGroup) -> &mut Self {
        if !group.is_empty() {
            self.criteria.post_filter_groups.push(group);
        }
        self.touch()
    }

    /// Returns the ids now restricting the collection.
    pub fn add_ids_filter(&mut self, ids: &[Value]) -> Result<Vec<Value>, GateError> {
        let id_field = self.backend.entity().id_field.clone();
        let applied = self.filters.add_ids_filter(&id_field, ids)?;
        self.touch();
        Ok(applied)
    }

    pub fn add_sort(&mut self, sort: SortSpec) -> &mut Self {
        self.criteria.sorts.push(sort);
        self.touch()
    }

    pub fn set_page(&mut self, page: u32, limit: i64) -> Result<&mut Self, GateError> {
        self.criteria.pagination = PaginationSpec::new(page, limit)?;
        Ok(self.touch())
    }

    pub fn add_aggregation(&mut self, aggregation: AggregationSpec) -> &mut Self {
        self.criteria.aggregations.push(aggregation);
        self.touch()
    }

    pub fn add_full_text(&mut self, clause: FullTextClause) -> &mut Self {
        self.criteria.full_text.push(clause);
        self.touch()
    }

    pub fn include_fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria
            .include_fields
            .extend(fields.into_iter().map(Into::into));
        self.touch()
    }

    pub fn exclude_fields<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria
            .exclude_fields
            .extend(fields.into_iter().map(Into::into));
        self.touch()
    }

    /// Keyset pagination: rows after `last_seen` in id order.
    pub fn scroll_after(&mut self, last_seen: Value) -> &mut Self {
        self.criteria.scroll_after = Some(last_seen);
        self.touch()
    }

    pub fn collapse(&mut self, collapse: CollapseSpec) -> &mut Self {
        self.criteria.collapse = Some(collapse);
        self.touch()
    }

    pub fn join(&mut self, join: JoinSpec) -> &mut Self {
        self.criteria.joins.push(join);
        self.touch()
    }

    pub fn raw_select(&mut self, expression: impl Into<String>) -> &mut Self {
        self.criteria.raw_selects.push(expression.into());
        self.touch()
    }

    pub fn distinct(&mut self, distinct: bool) -> &mut Self {
        self.criteria.distinct = distinct;
        self.touch()
    }

    pub fn group_by<I, S>(&mut self, fields: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.criteria.group_by = fields.into_iter().map(Into::into).collect();
        self.touch()
    }

    /// Merges a wire-contract criteria document into the accumulated state.
    pub fn apply_json(&mut self, input: &JsonValue) -> Result<&mut Self, GateError> {
        let parsed: CriteriaInput = serde_json::from_value(input.clone())
            .map_err(|e| GateError::Decode(e.to_string()))?;
        let has_pagination = parsed.pagination.is_some();
        let incoming = SearchCriteria::from_input(parsed)?;
        for group in incoming.filter_groups {
            self.filters.add_group(group);
        }
        self.criteria
            .post_filter_groups
            .extend(incoming.post_filter_groups);
        self.criteria.sorts.extend(incoming.sorts);
        if has_pagination {
            self.criteria.pagination = incoming.pagination;
        }
        self.criteria.aggregations.extend(incoming.aggregations);
        self.criteria.full_text.extend(incoming.full_text);
        self.criteria.exclude_fields.extend(incoming.exclude_fields);
        Ok(self.touch())
    }

    /// The criteria the next load compiles.
    pub fn criteria(&self) -> SearchCriteria {
        SearchCriteria {
            filter_groups: self.filters.groups().to_vec(),
            ..self.criteria.clone()
        }
    }

    pub async fn load(&mut self) -> Result<&RecordSet, GateError> {
        if self.loaded.is_none() {
            let criteria = self.criteria();
            let outcome = self.backend.search(&criteria).await?;
            debug!(
                entity = %self.backend.entity().name,
                rows = outcome.rows.len(),
                total = outcome.total,
                "collection loaded"
            );
            self.loaded = Some(Loaded {
                records: outcome.rows.into_iter().map(Record::from_map).collect(),
                total: outcome.total,
                aggregations: outcome.aggregations,
            });
        }
        Ok(&self.loaded_state()?.records)
    }

    pub async fn reload(&mut self) -> Result<&RecordSet, GateError> {
        self.loaded = None;
        self.load().await
    }

    fn loaded_state(&self) -> Result<&Loaded, GateError> {
        self.loaded.as_ref().ok_or(GateError::EmptyResult {
            operation: "collection load",
        })
    }

    pub async fn get_data(&mut self) -> Result<Vec<Payload>, GateError> {
        Ok(self
            .load()
            .await?
            .iter()
            .map(|r| r.as_map().clone())
            .collect())
    }

    /// Rows on the loaded page.
    pub async fn get_size(&mut self) -> Result<usize, GateError> {
        Ok(self.load().await?.len())
    }

    /// Matches across all pages; the distinct total under collapsing.
    pub async fn get_total_items_count(&mut self) -> Result<u64, GateError> {
        self.load().await?;
        Ok(self.loaded_state()?.total)
    }

    pub async fn get_aggregation(&mut self, name: &str) -> Result<Option<AggregationValue>, GateError> {
        self.load().await?;
        Ok(self.loaded_state()?.aggregations.get(name).cloned())
    }

    pub async fn get_aggregations(&mut self) -> Result<Aggregations, GateError> {
        self.load().await?;
        Ok(self.loaded_state()?.aggregations.clone())
    }

    /// Back to an empty, unloaded collection.
    pub fn clear(&mut self) {
        self.filters.clear();
        self.criteria = SearchCriteria::new();
        self.loaded = None;
    }
}

impl<B: WriteBackend> Collection<B> {
    /// Deletes everything the accumulated filters match. Refuses to run
    /// without a filter.
    pub async fn delete_by_filter(&mut self) -> Result<u64, GateError> {
        if self.filters.is_empty() {
            return Err(GateError::FilterNotSpecified {
                entity: self.backend.entity().name.clone(),
            });
        }
        let deleted = self.backend.delete(self.filters.groups()).await?;
        self.loaded = None;
        Ok(deleted)
    }

    pub fn writer(&self) -> BulkWriteCoordinator<'_, B> {
        BulkWriteCoordinator::new(self.backend.as_ref())
    }
}
