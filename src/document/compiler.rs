use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::Value;
use crate::config::GateConfig;
use crate::criteria::{SearchCriteria, SortDirection};
use crate::document::aggregation::{AggregationLayout, build_aggregations};
use crate::document::dsl::{BoolQuery, DocQuery, RangeBounds, SearchRequest, SourceFilter};
use crate::document::nested::{
    Clause, NestedPartition, conjunction, disjunction, nested_container,
};
use crate::error::GateError;
use crate::filter::{FilterCondition, FilterGroup, FilterOperator, FilterValue, GroupLogic};
use crate::query::error::QueryError;
use crate::query::planner::LIKE_WILDCARD;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const BACKEND: &str = "document";

/// A compiled document-store read plus what response processing needs to
/// undo the compiler's wrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSearch {
    pub request: SearchRequest,
    pub layout: Vec<AggregationLayout>,
    /// Set under collapsing: the top-level distinct-count aggregation exists,
    /// and whether it sits inside a post-filter wrapper.
    pub total_distinct: Option<bool>,
}

/// Filter clauses of AND groups that live under each nested path, reused to
/// restrict nested sorts to matching sub-objects.
type NestedFilters = BTreeMap<String, Vec<Clause>>;

pub struct DocumentCompiler<'a> {
    entity: &'a EntityDescriptor,
    config: &'a GateConfig,
}

impl<'a> DocumentCompiler<'a> {
    pub fn new(entity: &'a EntityDescriptor, config: &'a GateConfig) -> Self {
        Self { entity, config }
    }

    pub fn entity(&self) -> &EntityDescriptor {
        self.entity
    }

    pub fn config(&self) -> &GateConfig {
        self.config
    }

    pub fn compile(&self, criteria: &SearchCriteria) -> Result<DocumentSearch, GateError> {
        reject_relational_clauses(criteria)?;

        let mut request = SearchRequest::new(&self.entity.storage_name);
        let (mut main, nested_filters) = self.compile_bool(&criteria.filter_groups, true)?;
        for clause in &criteria.full_text {
            main.must.push(DocQuery::MultiMatch {
                query: clause.value.clone(),
                fields: clause.fields.clone(),
                match_type: clause.match_type,
                parameters: clause.parameters.clone(),
            });
        }
        request.query = main.into_query();
        request.post_filter = self.compile_groups(&criteria.post_filter_groups, false)?;

        match &criteria.scroll_after {
            Some(last_seen) => {
                request.sort = vec![json!({ &self.entity.id_field: { "order": "asc" } })];
                request.search_after = Some(vec![last_seen.to_json()]);
                request.from = 0;
                request.size = criteria
                    .pagination
                    .bounded_limit()
                    .unwrap_or(self.config.max_result_window);
            }
            None => {
                request.sort = self.compile_sorts(criteria, &nested_filters);
                let (from, size) = self.window(criteria);
                request.from = from;
                request.size = size;
            }
        }

        if !criteria.include_fields.is_empty() || !criteria.exclude_fields.is_empty() {
            request.source = Some(SourceFilter {
                includes: criteria.include_fields.clone(),
                excludes: criteria.exclude_fields.clone(),
            });
        }

        if let Some(collapse) = &criteria.collapse {
            let mut body = Map::new();
            body.insert("field".into(), json!(collapse.field));
            if let Some(name) = &collapse.inner_hits {
                body.insert("inner_hits".into(), json!({ "name": name }));
            }
            request.collapse = Some(JsonValue::Object(body));
        }

        let (aggs, layout, total_distinct) = build_aggregations(self, criteria)?;
        request.aggs = aggs;

        debug!(
            entity = %self.entity.name,
            from = request.from,
            size = request.size,
            aggregations = layout.len(),
            "compiled document search"
        );
        Ok(DocumentSearch {
            request,
            layout,
            total_distinct,
        })
    }

    /// AND of all groups as one query; `None` when nothing filters.
    pub fn compile_groups(
        &self,
        groups: &[FilterGroup],
        inner_hits: bool,
    ) -> Result<Option<DocQuery>, GateError> {
        let (bool_query, _) = self.compile_bool(groups, inner_hits)?;
        Ok((!bool_query.is_empty()).then(|| bool_query.into_query()))
    }

    fn compile_bool(
        &self,
        groups: &[FilterGroup],
        inner_hits: bool,
    ) -> Result<(BoolQuery, NestedFilters), GateError> {
        let mut top = BoolQuery::default();
        let mut nested_filters = NestedFilters::new();
        for group in groups.iter().filter(|g| !g.is_empty()) {
            let mut partition = NestedPartition::default();
            for condition in &group.conditions {
                let clause = self.compile_condition(condition)?;
                partition.push(self.entity.nested_path_of(&condition.field), clause);
            }
            match group.effective_logic() {
                GroupLogic::And => {
                    for clause in partition.root {
                        if clause.negated {
                            top.must_not.push(clause.query);
                        } else {
                            top.filter.push(clause.query);
                        }
                    }
                    for (path, clauses) in partition.nested {
                        nested_filters
                            .entry(path.clone())
                            .or_default()
                            .extend(clauses.iter().cloned());
                        top.filter.push(nested_container(
                            self.entity,
                            &path,
                            conjunction(clauses),
                            inner_hits,
                        ));
                    }
                }
                GroupLogic::Or => {
                    let mut alternatives: Vec<Clause> = partition.root;
                    for (path, clauses) in partition.nested {
                        alternatives.push(Clause::positive(nested_container(
                            self.entity,
                            &path,
                            disjunction(clauses),
                            inner_hits,
                        )));
                    }
                    top.filter.push(disjunction(alternatives));
                }
            }
        }
        Ok((top, nested_filters))
    }

    pub fn compile_condition(&self, condition: &FilterCondition) -> Result<Clause, GateError> {
        let field = condition.field.clone();
        let range = |bounds: RangeBounds| DocQuery::Range {
            field: field.clone(),
            bounds,
        };
        let clause = match (condition.operator, &condition.value) {
            (FilterOperator::Eq, FilterValue::Scalar(v)) => {
                Clause::positive(DocQuery::term(&field, v.to_json()))
            }
            (FilterOperator::Neq, FilterValue::Scalar(v)) => {
                present_but_not(&field, DocQuery::term(&field, v.to_json()))
            }
            (FilterOperator::In, FilterValue::List(values)) => {
                Clause::positive(terms(&field, values))
            }
            (FilterOperator::NotIn, FilterValue::List(values)) => {
                present_but_not(&field, terms(&field, values))
            }
            (FilterOperator::Between, FilterValue::Range { from, to }) => {
                Clause::positive(range(RangeBounds {
                    gte: Some(from.to_json()),
                    lte: Some(to.to_json()),
                    ..RangeBounds::default()
                }))
            }
            (FilterOperator::Lt, FilterValue::Scalar(v)) => Clause::positive(range(RangeBounds {
                lt: Some(v.to_json()),
                ..RangeBounds::default()
            })),
            (FilterOperator::Lte, FilterValue::Scalar(v)) => Clause::positive(range(RangeBounds {
                lte: Some(v.to_json()),
                ..RangeBounds::default()
            })),
            (FilterOperator::Gt, FilterValue::Scalar(v)) => Clause::positive(range(RangeBounds {
                gt: Some(v.to_json()),
                ..RangeBounds::default()
            })),
            (FilterOperator::Gte, FilterValue::Scalar(v)) => Clause::positive(range(RangeBounds {
                gte: Some(v.to_json()),
                ..RangeBounds::default()
            })),
            (FilterOperator::Exists | FilterOperator::NotNull, _) => {
                Clause::positive(DocQuery::exists(&field))
            }
            (FilterOperator::NotExists, _) => Clause::negative(DocQuery::exists(&field)),
            (FilterOperator::Like, FilterValue::Scalar(v)) => {
                Clause::positive(wildcard(&field, &text_of(v)))
            }
            (FilterOperator::NotLike, FilterValue::Scalar(v)) => {
                present_but_not(&field, wildcard(&field, &text_of(v)))
            }
            (FilterOperator::Regexp, FilterValue::Scalar(v)) => {
                Clause::positive(regexp(&field, &text_of(v)))
            }
            (FilterOperator::NotRegexp, FilterValue::Scalar(v)) => {
                present_but_not(&field, regexp(&field, &text_of(v)))
            }
            (FilterOperator::InOrLikes, FilterValue::List(values)) => {
                let (patterns, exact): (Vec<&Value>, Vec<&Value>) = values
                    .iter()
                    .partition(|v| text_of(v).contains(LIKE_WILDCARD));
                let mut alternatives = Vec::with_capacity(patterns.len() + 1);
                if !exact.is_empty() {
                    let exact: Vec<Value> = exact.into_iter().cloned().collect();
                    alternatives.push(Clause::positive(terms(&field, &exact)));
                }
                for pattern in patterns {
                    alternatives.push(Clause::positive(wildcard(&field, &text_of(pattern))));
                }
                Clause::positive(disjunction(alternatives))
            }
            (op, other) => {
                return Err(GateError::InvalidFilter(format!(
                    "operator '{op}' on '{field}' cannot take {other:?}"
                )));
            }
        };
        Ok(clause)
    }

    fn compile_sorts(&self, criteria: &SearchCriteria, nested_filters: &NestedFilters) -> Vec<JsonValue> {
        criteria
            .sorts
            .iter()
            .map(|sort| {
                let order = match sort.direction {
                    SortDirection::Asc => "asc",
                    SortDirection::Desc => "desc",
                };
                let mut body = Map::new();
                body.insert("order".into(), json!(order));
                if let Some(path) = self.entity.nested_path_of(&sort.field) {
                    if let Some(mode) = sort.mode {
                        body.insert("mode".into(), json!(mode.as_str()));
                    }
                    let mut nested = Map::new();
                    nested.insert("path".into(), json!(path));
                    if let Some(clauses) = nested_filters.get(path) {
                        nested.insert("filter".into(), conjunction(clauses.clone()).to_json());
                    }
                    body.insert("nested".into(), JsonValue::Object(nested));
                } else if sort.mode.is_some() {
                    debug!(field = %sort.field, "sort mode ignored on a root field");
                }
                json!({ &sort.field: body })
            })
            .collect()
    }

    /// `(from, size)` within the store's result window.
    fn window(&self, criteria: &SearchCriteria) -> (u64, u64) {
        let max = self.config.max_result_window;
        let from = criteria.pagination.offset();
        let requested = criteria
            .pagination
            .bounded_limit()
            .unwrap_or_else(|| max.saturating_sub(from));
        if from.saturating_add(requested) > max {
            let clamped = max.saturating_sub(from);
            warn!(
                entity = %self.entity.name,
                from,
                requested,
                clamped,
                max_result_window = max,
                "result window exceeds the store maximum; clamping"
            );
            return (from, clamped);
        }
        (from, requested)
    }
}

fn reject_relational_clauses(criteria: &SearchCriteria) -> Result<(), GateError> {
    let clause = if !criteria.joins.is_empty() {
        "joins"
    } else if !criteria.raw_selects.is_empty() {
        "raw select expressions"
    } else if !criteria.group_by.is_empty() {
        "group by"
    } else if criteria.distinct {
        "distinct"
    } else {
        return Ok(());
    };
    Err(QueryError::UnsupportedClause {
        backend: BACKEND,
        clause: clause.into(),
    }
    .into())
}

/// Negated operators only match documents that hold a value for the field,
/// the same rows a SQL `<>`/`NOT IN`/`NOT LIKE` keeps when the column is NULL.
fn present_but_not(field: &str, excluded: DocQuery) -> Clause {
    Clause::positive(DocQuery::Bool(BoolQuery {
        filter: vec![DocQuery::exists(field)],
        must_not: vec![excluded],
        ..BoolQuery::default()
    }))
}

fn terms(field: &str, values: &[Value]) -> DocQuery {
    DocQuery::Terms {
        field: field.to_string(),
        values: values.iter().map(Value::to_json).collect(),
    }
}

fn wildcard(field: &str, raw: &str) -> DocQuery {
    DocQuery::Wildcard {
        field: field.to_string(),
        pattern: wildcard_pattern(raw),
        case_insensitive: true,
    }
}

fn regexp(field: &str, raw: &str) -> DocQuery {
    DocQuery::Regexp {
        field: field.to_string(),
        pattern: raw.to_string(),
        case_insensitive: true,
    }
}

/// Escapes the store's own metacharacters (`?`, `\`) and keeps `*`; a value
/// without wildcards matches as a substring.
pub fn wildcard_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 2);
    for ch in raw.chars() {
        match ch {
            '\\' | '?' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            other => escaped.push(other),
        }
    }
    if raw.contains(LIKE_WILDCARD) {
        escaped
    } else {
        format!("*{escaped}*")
    }
}

fn text_of(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_key_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{DocumentCompiler, wildcard_pattern};
    use crate::catalog::schema::EntityDescriptor;
    use crate::config::GateConfig;
    use crate::criteria::{PaginationSpec, SearchCriteria, SortMode, SortSpec};
    use crate::document::dsl::DocQuery;
    use crate::filter::{FilterCondition, FilterGroup, FilterOperator, FilterValue};
    use crate::query::plan::JoinSpec;
    use serde_json::json;

    fn products() -> EntityDescriptor {
        EntityDescriptor::new("product", "products")
            .with_nested_path("variants", true)
    }

    #[test]
    fn wildcard_escaping() {
        assert_eq!(wildcard_pattern("ab*"), "ab*");
        assert_eq!(wildcard_pattern("what?"), "*what\\?*");
    }

    #[test]
    fn and_group_splits_root_and_nested() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new().filter(FilterGroup::and(vec![
            FilterCondition::eq("status", "active"),
            FilterCondition::eq("variants.size", "m"),
            FilterCondition::eq("variants.color", "red"),
            FilterCondition::new("brand", FilterOperator::Neq, FilterValue::Scalar("x".into()))
                .expect("neq"),
        ]));
        let compiled = compiler.compile(&criteria).expect("compile");
        assert_eq!(
            compiled.request.query.to_json(),
            json!({"bool": {
                "filter": [
                    {"term": {"status": {"value": "active"}}},
                    {"bool": {
                        "filter": [{"exists": {"field": "brand"}}],
                        "must_not": [{"term": {"brand": {"value": "x"}}}]
                    }},
                    {"nested": {
                        "path": "variants",
                        "query": {"bool": {"filter": [
                            {"term": {"variants.size": {"value": "m"}}},
                            {"term": {"variants.color": {"value": "red"}}}
                        ]}},
                        "inner_hits": {"name": "variants"}
                    }}
                ]
            }})
        );
    }

    #[test]
    fn or_group_becomes_should_with_minimum() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let query = compiler
            .compile_groups(
                &[FilterGroup::or(vec![
                    FilterCondition::eq("status", "active"),
                    FilterCondition::eq("status", "draft"),
                ])],
                false,
            )
            .expect("compile")
            .expect("some");
        assert_eq!(
            query.to_json(),
            json!({"bool": {
                "should": [
                    {"term": {"status": {"value": "active"}}},
                    {"term": {"status": {"value": "draft"}}}
                ],
                "minimum_should_match": 1
            }})
        );
    }

    #[test]
    fn single_condition_group_ignores_logic() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let cond = FilterCondition::eq("status", "active");
        let or = compiler
            .compile_groups(&[FilterGroup::or(vec![cond.clone()])], false)
            .expect("or");
        let and = compiler
            .compile_groups(&[FilterGroup::and(vec![cond])], false)
            .expect("and");
        assert_eq!(or, and);
        assert_eq!(or, Some(DocQuery::term("status", json!("active"))));
    }

    #[test]
    fn window_is_clamped_to_store_maximum() {
        let entity = products();
        let config = GateConfig::default().with_max_result_window(100);
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria =
            SearchCriteria::new().paginate(PaginationSpec::new(3, 40).expect("page"));
        let compiled = compiler.compile(&criteria).expect("compile");
        assert_eq!((compiled.request.from, compiled.request.size), (80, 20));

        let unbounded = compiler.compile(&SearchCriteria::new()).expect("compile");
        assert_eq!((unbounded.request.from, unbounded.request.size), (0, 100));
    }

    #[test]
    fn nested_sort_carries_mode_and_filter() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new()
            .filter(FilterGroup::and(vec![FilterCondition::eq("variants.size", "m")]))
            .sort(SortSpec::asc("variants.price").with_mode(SortMode::Min))
            .sort(SortSpec::desc("name").with_mode(SortMode::Max));
        let compiled = compiler.compile(&criteria).expect("compile");
        assert_eq!(
            compiled.request.sort,
            vec![
                json!({"variants.price": {
                    "order": "asc",
                    "mode": "min",
                    "nested": {
                        "path": "variants",
                        "filter": {"term": {"variants.size": {"value": "m"}}}
                    }
                }}),
                json!({"name": {"order": "desc"}}),
            ]
        );
    }

    #[test]
    fn joins_are_rejected() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let mut criteria = SearchCriteria::new();
        criteria.joins.push(JoinSpec::inner("brands", "brand_id", "brands.id"));
        let err = compiler.compile(&criteria).expect_err("joins");
        assert_eq!(err.code_str(), "invalid_query");
    }
}
