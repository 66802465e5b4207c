use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::{ColumnTypes, Value};
use crate::config::GateConfig;
use crate::criteria::{
    AggregationKind, AggregationSpec, AggregationTarget, MetricKind, SearchCriteria,
    SortDirection,
};
use crate::error::GateError;
use crate::filter::{
    FilterCondition, FilterGroup, FilterOperator, FilterValue, GroupLogic, without_fields,
};
use crate::query::error::QueryError;
use crate::query::plan::{
    Aggregate, ColumnRef, DeleteStatement, Expr, InsertStatement, Order, Query, SelectItem,
    UpdateStatement,
};
use crate::query::sql::quote_ident;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use tracing::debug;

/// Wildcard callers use in LIKE values, independent of the backend.
pub const LIKE_WILDCARD: char = '*';

const BACKEND: &str = "relational";

/// Output column names of compiled aggregation queries.
pub const KEY_COLUMN: &str = "key";
pub const DOC_COUNT_COLUMN: &str = "doc_count";
pub const METRIC_COLUMN: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldUse {
    Filter,
    Project,
}

/// A compiled relational read: the page query, its unpaged count and one
/// query per aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationalSearch {
    pub select: Query,
    pub count: Query,
    pub aggregations: Vec<RelationalAggregation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationalAggregation {
    pub spec: AggregationSpec,
    pub query: Query,
}

/// Compiles abstract criteria into relational statements for one entity,
/// bound to the entity's column-type map.
pub struct RelationalCompiler<'a> {
    entity: &'a EntityDescriptor,
    columns: &'a ColumnTypes,
    config: &'a GateConfig,
    qualifiers: BTreeSet<String>,
}

impl<'a> RelationalCompiler<'a> {
    pub fn new(entity: &'a EntityDescriptor, columns: &'a ColumnTypes, config: &'a GateConfig) -> Self {
        Self {
            entity,
            columns,
            config,
            qualifiers: BTreeSet::new(),
        }
    }

    pub fn compile(&mut self, criteria: &SearchCriteria) -> Result<RelationalSearch, GateError> {
        if criteria.collapse.is_some() {
            return Err(QueryError::UnsupportedClause {
                backend: BACKEND,
                clause: "collapse".into(),
            }
            .into());
        }
        self.qualifiers = criteria
            .joins
            .iter()
            .map(|j| j.reference_name().to_string())
            .collect();
        if !self.qualifiers.is_empty() {
            self.qualifiers.insert(self.entity.storage_name.clone());
        }

        let mut base = Query::select(self.projection(criteria)?)
            .from(&self.entity.storage_name)
            .distinct(criteria.distinct);
        for join in &criteria.joins {
            base = base.join(join.clone());
        }
        if !criteria.group_by.is_empty() {
            let group_by = criteria
                .group_by
                .iter()
                .map(|f| self.resolve(f, FieldUse::Project))
                .collect::<Result<Vec<_>, _>>()?;
            base = base.group_by(group_by);
        }

        let mut predicate_parts = Vec::new();
        if let Some(expr) = self.compile_groups(&criteria.filter_groups)? {
            predicate_parts.push(expr);
        }
        for clause in &criteria.full_text {
            let mut alternatives = Vec::with_capacity(clause.fields.len());
            for field in &clause.fields {
                alternatives.push(Expr::Like(
                    self.resolve(field, FieldUse::Filter)?,
                    like_pattern(&clause.value),
                ));
            }
            if let Some(expr) = Expr::any(alternatives) {
                predicate_parts.push(expr);
            }
        }
        let aggregation_base = predicate_parts.clone();
        if let Some(expr) = self.compile_groups(&criteria.post_filter_groups)? {
            predicate_parts.push(expr);
        }

        let mut count = base.clone();
        if let Some(expr) = Expr::all(predicate_parts.clone()) {
            count = count.where_(expr);
        }

        let mut select = count.clone();
        match &criteria.scroll_after {
            Some(last_seen) => {
                let id = self.resolve(&self.entity.id_field, FieldUse::Project)?;
                select = select
                    .where_(id.clone().gt(last_seen.clone()))
                    .order_by(id, Order::Asc);
            }
            None => {
                for sort in &criteria.sorts {
                    let column = self.resolve(&sort.field, FieldUse::Project)?;
                    let order = match sort.direction {
                        SortDirection::Asc => Order::Asc,
                        SortDirection::Desc => Order::Desc,
                    };
                    select = select.order_by(column, order);
                }
                select = select.offset(criteria.pagination.offset());
            }
        }
        if let Some(limit) = criteria.pagination.bounded_limit() {
            select = select.limit(limit);
        }

        let mut aggregations = Vec::with_capacity(criteria.aggregations.len());
        for spec in &criteria.aggregations {
            let mut parts = aggregation_base.clone();
            let excluded = self.facet_exclusions(spec);
            let facet_groups = without_fields(&criteria.post_filter_groups, &excluded);
            if let Some(expr) = self.compile_groups(&facet_groups)? {
                parts.push(expr);
            }
            aggregations.push(RelationalAggregation {
                spec: spec.clone(),
                query: self.compile_aggregation(spec, parts)?,
            });
        }

        debug!(
            entity = %self.entity.name,
            groups = criteria.filter_groups.len(),
            aggregations = aggregations.len(),
            "compiled relational search"
        );
        Ok(RelationalSearch {
            select,
            count,
            aggregations,
        })
    }

    /// AND of all groups; `None` when nothing filters.
    pub fn compile_groups(&self, groups: &[FilterGroup]) -> Result<Option<Expr>, GateError> {
        let mut parts = Vec::with_capacity(groups.len());
        for group in groups.iter().filter(|g| !g.is_empty()) {
            let compiled = group
                .conditions
                .iter()
                .map(|c| self.compile_condition(c))
                .collect::<Result<Vec<_>, _>>()?;
            let expr = match group.effective_logic() {
                GroupLogic::And => Expr::all(compiled),
                GroupLogic::Or => Expr::any(compiled),
            };
            if let Some(expr) = expr {
                parts.push(expr);
            }
        }
        let combined = Expr::all(flatten_and(parts));
        if let Some(expr) = &combined {
            expr.validate_depth()?;
        }
        Ok(combined)
    }

    pub fn compile_condition(&self, condition: &FilterCondition) -> Result<Expr, GateError> {
        let column = self.resolve(&condition.field, FieldUse::Filter)?;
        let json_document = column.json_path.is_none() && self.columns.is_json(&column.column);
        let value = &condition.value;
        let expr = match (condition.operator, value) {
            (FilterOperator::Eq, FilterValue::Scalar(v)) if json_document => {
                Expr::JsonContains(column, v.clone())
            }
            (FilterOperator::Neq, FilterValue::Scalar(v)) if json_document => {
                Expr::JsonContains(column, v.clone()).not()
            }
            (FilterOperator::In, FilterValue::List(values)) if json_document => {
                json_any(&column, values)
            }
            (FilterOperator::NotIn, FilterValue::List(values)) if json_document => {
                json_any(&column, values).not()
            }
            (FilterOperator::Eq, FilterValue::Scalar(v)) => column.eq(v.clone()),
            (FilterOperator::Neq, FilterValue::Scalar(v)) => column.neq(v.clone()),
            (FilterOperator::Lt, FilterValue::Scalar(v)) => column.lt(v.clone()),
            (FilterOperator::Lte, FilterValue::Scalar(v)) => column.lte(v.clone()),
            (FilterOperator::Gt, FilterValue::Scalar(v)) => column.gt(v.clone()),
            (FilterOperator::Gte, FilterValue::Scalar(v)) => column.gte(v.clone()),
            (FilterOperator::In, FilterValue::List(values)) => column.in_(values.clone()),
            (FilterOperator::NotIn, FilterValue::List(values)) => {
                Expr::NotIn(column, values.clone())
            }
            (FilterOperator::Between, FilterValue::Range { from, to }) => {
                column.between(from.clone(), to.clone())
            }
            (FilterOperator::Exists | FilterOperator::NotNull, _) => column.is_not_null(),
            (FilterOperator::NotExists, _) => column.is_null(),
            (FilterOperator::Like, FilterValue::Scalar(v)) => {
                Expr::Like(column, like_pattern(&text_of(v)))
            }
            (FilterOperator::NotLike, FilterValue::Scalar(v)) => {
                Expr::NotLike(column, like_pattern(&text_of(v)))
            }
            (FilterOperator::Regexp, FilterValue::Scalar(v)) => {
                Expr::Regexp(column, anchored_regex(&text_of(v)))
            }
            (FilterOperator::NotRegexp, FilterValue::Scalar(v)) => {
                Expr::NotRegexp(column, anchored_regex(&text_of(v)))
            }
            (FilterOperator::InOrLikes, FilterValue::List(values)) => {
                let (patterns, exact): (Vec<&Value>, Vec<&Value>) = values
                    .iter()
                    .partition(|v| text_of(v).contains(LIKE_WILDCARD));
                let mut alternatives = Vec::with_capacity(patterns.len() + 1);
                if !exact.is_empty() {
                    alternatives.push(column.clone().in_(exact.into_iter().cloned().collect()));
                }
                for pattern in patterns {
                    alternatives.push(Expr::Like(column.clone(), like_pattern(&text_of(pattern))));
                }
                Expr::any(alternatives).ok_or_else(|| {
                    GateError::InvalidFilter(format!(
                        "in_or_likes on '{}' has no values",
                        condition.field
                    ))
                })?
            }
            (op, other) => {
                return Err(GateError::InvalidFilter(format!(
                    "operator '{op}' on '{}' cannot take {other:?}",
                    condition.field
                )));
            }
        };
        Ok(expr)
    }

    /// Plain or upserting insert of JSON payloads. Columns are the union of
    /// payload keys in first-seen order; a payload missing a column binds NULL.
    pub fn insert(
        &self,
        payloads: &[Map<String, JsonValue>],
        on_duplicate_update: Vec<String>,
    ) -> Result<InsertStatement, GateError> {
        let mut columns: Vec<String> = Vec::new();
        for payload in payloads {
            for key in payload.keys() {
                if !columns.iter().any(|c| c == key) {
                    self.check_column(key)?;
                    columns.push(key.clone());
                }
            }
        }
        let rows = payloads
            .iter()
            .map(|payload| {
                columns
                    .iter()
                    .map(|c| self.bind_value(c, payload.get(c)))
                    .collect()
            })
            .collect();
        Ok(InsertStatement {
            table: self.entity.storage_name.clone(),
            columns,
            rows,
            on_duplicate_update,
        })
    }

    pub fn update(
        &self,
        id: &Value,
        changes: &Map<String, JsonValue>,
    ) -> Result<UpdateStatement, GateError> {
        let mut assignments = Vec::with_capacity(changes.len());
        for (column, value) in changes {
            self.check_column(column)?;
            assignments.push((column.clone(), self.bind_value(column, Some(value))));
        }
        Ok(UpdateStatement {
            table: self.entity.storage_name.clone(),
            assignments,
            predicate: ColumnRef::new(&self.entity.id_field).eq(id.clone()),
        })
    }

    pub fn delete(&self, groups: &[FilterGroup]) -> Result<DeleteStatement, GateError> {
        let predicate = self
            .compile_groups(groups)?
            .ok_or_else(|| GateError::FilterNotSpecified {
                entity: self.entity.name.clone(),
            })?;
        Ok(DeleteStatement {
            table: self.entity.storage_name.clone(),
            predicate,
        })
    }

    fn projection(&self, criteria: &SearchCriteria) -> Result<Vec<SelectItem>, GateError> {
        let mut items = Vec::new();
        if !criteria.include_fields.is_empty() {
            for field in &criteria.include_fields {
                if criteria.exclude_fields.contains(field) {
                    continue;
                }
                items.push(SelectItem::column(self.resolve(field, FieldUse::Project)?));
            }
        } else if !criteria.exclude_fields.is_empty() && !self.columns.is_empty() {
            for column in self.columns.columns() {
                if !criteria.exclude_fields.iter().any(|f| f == column) {
                    items.push(SelectItem::column(self.resolve(column, FieldUse::Project)?));
                }
            }
        }
        if !criteria.raw_selects.is_empty() {
            if items.is_empty() {
                items.push(SelectItem::Raw(format!(
                    "{}.*",
                    quote_ident(&self.entity.storage_name)
                )));
            }
            items.extend(criteria.raw_selects.iter().cloned().map(SelectItem::Raw));
        }
        Ok(items)
    }

    fn compile_aggregation(
        &self,
        spec: &AggregationSpec,
        mut predicate: Vec<Expr>,
    ) -> Result<Query, GateError> {
        if let AggregationKind::Filter(groups) = &spec.kind {
            if let Some(expr) = self.compile_groups(groups)? {
                predicate.push(expr);
            }
        }
        let query = match (&spec.kind, &spec.target) {
            (AggregationKind::Terms | AggregationKind::Filter(_), AggregationTarget::Field(f)) => {
                let column = self.resolve(f, FieldUse::Project)?;
                let limit = spec
                    .bucket_limit
                    .unwrap_or_else(|| self.config.bucket_size_for(f));
                Query::select(vec![
                    SelectItem::Column {
                        column: column.clone(),
                        alias: Some(KEY_COLUMN.into()),
                    },
                    SelectItem::Aggregate {
                        aggregate: Aggregate::Count,
                        alias: DOC_COUNT_COLUMN.into(),
                    },
                ])
                .group_by(vec![column])
                .order_by(ColumnRef::new(DOC_COUNT_COLUMN), Order::Desc)
                .limit(u64::from(limit))
            }
            (AggregationKind::Metric(metric), AggregationTarget::Field(f)) => {
                let column = self.resolve(f, FieldUse::Project)?;
                let item = |aggregate, alias: &str| SelectItem::Aggregate {
                    aggregate,
                    alias: alias.to_string(),
                };
                let items = match metric {
                    MetricKind::Avg => vec![item(Aggregate::Avg(column.clone()), METRIC_COLUMN)],
                    MetricKind::Min => vec![item(Aggregate::Min(column.clone()), METRIC_COLUMN)],
                    MetricKind::Max => vec![item(Aggregate::Max(column.clone()), METRIC_COLUMN)],
                    MetricKind::Sum => vec![item(Aggregate::Sum(column.clone()), METRIC_COLUMN)],
                    MetricKind::ValueCount => vec![item(Aggregate::Count, METRIC_COLUMN)],
                    MetricKind::Stats => vec![
                        item(Aggregate::Count, "count"),
                        item(Aggregate::Min(column.clone()), "min"),
                        item(Aggregate::Max(column.clone()), "max"),
                        item(Aggregate::Avg(column.clone()), "avg"),
                        item(Aggregate::Sum(column.clone()), "sum"),
                    ],
                };
                if matches!(metric, MetricKind::ValueCount | MetricKind::Stats) {
                    predicate.push(column.is_not_null());
                }
                Query::select(items)
            }
            (AggregationKind::Composite, AggregationTarget::Fields(sources)) => {
                if spec.after_key.is_some() {
                    return Err(QueryError::UnsupportedClause {
                        backend: BACKEND,
                        clause: "composite after_key".into(),
                    }
                    .into());
                }
                let mut items = Vec::with_capacity(sources.len() + 1);
                let mut group_by = Vec::with_capacity(sources.len());
                for (alias, field) in sources {
                    let column = self.resolve(field, FieldUse::Project)?;
                    items.push(SelectItem::Column {
                        column: column.clone(),
                        alias: Some(alias.clone()),
                    });
                    group_by.push(column);
                }
                items.push(SelectItem::Aggregate {
                    aggregate: Aggregate::Count,
                    alias: DOC_COUNT_COLUMN.into(),
                });
                let mut query = Query::select(items).group_by(group_by.clone());
                for column in group_by {
                    query = query.order_by(column, Order::Asc);
                }
                query.limit(u64::from(
                    spec.bucket_limit.unwrap_or(self.config.composite_page_size),
                ))
            }
            (AggregationKind::Histogram, _) => {
                return Err(QueryError::UnsupportedClause {
                    backend: BACKEND,
                    clause: format!("histogram aggregation '{}'", spec.name),
                }
                .into());
            }
            (kind, target) => {
                return Err(GateError::InvalidFilter(format!(
                    "aggregation '{}' of kind {kind:?} cannot target {target:?}",
                    spec.name
                )));
            }
        };
        let mut query = query.from(&self.entity.storage_name);
        if let Some(expr) = Expr::all(predicate) {
            query = query.where_(expr);
        }
        Ok(query)
    }

    fn facet_exclusions(&self, spec: &AggregationSpec) -> BTreeSet<String> {
        spec.target
            .fields()
            .into_iter()
            .flat_map(|f| self.entity.facet_siblings(f))
            .collect()
    }

    fn check_column(&self, column: &str) -> Result<(), GateError> {
        if !self.columns.is_empty() && !self.columns.contains(column) {
            return Err(QueryError::ColumnNotFound {
                table: self.entity.storage_name.clone(),
                column: column.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn bind_value(&self, column: &str, value: Option<&JsonValue>) -> Value {
        match value {
            None | Some(JsonValue::Null) => Value::Null,
            Some(v) if self.columns.is_json(column) => Value::Json(v.clone()),
            Some(v) => Value::from_json(v),
        }
    }

    fn resolve(&self, field: &str, purpose: FieldUse) -> Result<ColumnRef, GateError> {
        let (head, rest) = match field.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (field, None),
        };
        if let Some(rest) = rest {
            if self.qualifiers.contains(head) {
                if head == self.entity.storage_name {
                    return self.resolve(rest, purpose);
                }
                return Ok(ColumnRef::qualified(head, rest));
            }
        }
        self.check_column(head)?;
        let qualifier = if self.qualifiers.is_empty() {
            None
        } else {
            Some(self.entity.storage_name.clone())
        };
        let json_path = match rest {
            None => None,
            Some(path) => {
                if !self.columns.is_empty() && !self.columns.is_json(head) {
                    return Err(QueryError::InvalidQuery {
                        reason: format!("column '{head}' is not a JSON column"),
                    }
                    .into());
                }
                if purpose == FieldUse::Filter && !self.entity.json_filter_allowed(head, field) {
                    return Err(GateError::UnauthorizedFieldAccess {
                        entity: self.entity.name.clone(),
                        field: field.to_string(),
                    });
                }
                Some(path.to_string())
            }
        };
        Ok(ColumnRef {
            qualifier,
            column: head.to_string(),
            json_path,
        })
    }
}

/// Rewrites the caller wildcard to SQL LIKE syntax. Literal `%`, `_` and the
/// escape character are escaped; a value without wildcards matches as a
/// substring.
pub fn like_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 2);
    for ch in raw.chars() {
        match ch {
            '\\' | '%' | '_' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            LIKE_WILDCARD => escaped.push('%'),
            other => escaped.push(other),
        }
    }
    if raw.contains(LIKE_WILDCARD) {
        escaped
    } else {
        format!("%{escaped}%")
    }
}

/// REGEXP matches anywhere in MySQL; callers expect a whole-value match.
pub fn anchored_regex(raw: &str) -> String {
    format!("^({raw})$")
}

fn text_of(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_key_string(),
    }
}

fn json_any(column: &ColumnRef, values: &[Value]) -> Expr {
    let alternatives = values
        .iter()
        .map(|v| Expr::JsonContains(column.clone(), v.clone()))
        .collect::<Vec<_>>();
    Expr::any(alternatives).unwrap_or(Expr::In(column.clone(), Vec::new()))
}

fn flatten_and(parts: Vec<Expr>) -> Vec<Expr> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            Expr::And(inner) => out.extend(inner),
            other => out.push(other),
        }
    }
    out
}
