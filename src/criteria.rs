//! The backend-agnostic criteria model and its wire contract.

use crate::catalog::types::Value;
use crate::error::GateError;
use crate::filter::{FilterCondition, FilterGroup, FilterOperator, FilterValue, GroupLogic};
use crate::query::plan::JoinSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }
}

/// Representative-value selection for sorting on a multi-valued nested field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Min,
    Max,
    Avg,
    Sum,
    Median,
}

impl SortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SortMode::Min => "min",
            SortMode::Max => "max",
            SortMode::Avg => "avg",
            SortMode::Sum => "sum",
            SortMode::Median => "median",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default, alias = "order")]
    pub direction: SortDirection,
    #[serde(default)]
    pub mode: Option<SortMode>,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
            mode: None,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
            mode: None,
        }
    }

    pub fn with_mode(mut self, mode: SortMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationSpec {
    pub page: u32,
    pub limit: i64,
}

impl PaginationSpec {
    pub const UNBOUNDED: i64 = -1;

    pub fn new(page: u32, limit: i64) -> Result<Self, GateError> {
        if page < 1 {
            return Err(GateError::InvalidFilter("page must be at least 1".into()));
        }
        if limit == 0 || limit < Self::UNBOUNDED {
            return Err(GateError::InvalidFilter(format!(
                "limit must be positive or {} for unbounded, got {limit}",
                Self::UNBOUNDED
            )));
        }
        if limit != Self::UNBOUNDED {
            let end = i64::from(page - 1)
                .checked_mul(limit)
                .and_then(|offset| offset.checked_add(limit));
            if end.is_none() {
                return Err(GateError::InvalidFilter(format!(
                    "page {page} of {limit} items is past the last addressable row"
                )));
            }
        }
        Ok(Self { page, limit })
    }

    pub fn unbounded() -> Self {
        Self {
            page: 1,
            limit: Self::UNBOUNDED,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit == Self::UNBOUNDED
    }

    /// `None` when unbounded.
    pub fn bounded_limit(&self) -> Option<u64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.limit as u64)
        }
    }

    pub fn offset(&self) -> u64 {
        match self.bounded_limit() {
            Some(limit) => u64::from(self.page.saturating_sub(1)).saturating_mul(limit),
            None => 0,
        }
    }
}

impl Default for PaginationSpec {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Avg,
    Min,
    Max,
    Sum,
    Stats,
    ValueCount,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Avg => "avg",
            MetricKind::Min => "min",
            MetricKind::Max => "max",
            MetricKind::Sum => "sum",
            MetricKind::Stats => "stats",
            MetricKind::ValueCount => "value_count",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregationKind {
    Terms,
    Histogram,
    Metric(MetricKind),
    /// Terms over the target, restricted to documents matching the groups.
    Filter(Vec<FilterGroup>),
    Composite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregationTarget {
    Field(String),
    /// Source alias to field, for composite aggregations.
    Fields(BTreeMap<String, String>),
}

impl AggregationTarget {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            AggregationTarget::Field(f) => vec![f.as_str()],
            AggregationTarget::Fields(map) => map.values().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub name: String,
    pub kind: AggregationKind,
    pub target: AggregationTarget,
    pub bucket_limit: Option<u32>,
    pub interval: Option<f64>,
    pub after_key: Option<JsonValue>,
}

impl AggregationSpec {
    pub fn terms(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: field.clone(),
            kind: AggregationKind::Terms,
            target: AggregationTarget::Field(field),
            bucket_limit: None,
            interval: None,
            after_key: None,
        }
    }

    pub fn histogram(field: impl Into<String>, interval: Option<f64>) -> Self {
        Self {
            kind: AggregationKind::Histogram,
            interval,
            ..Self::terms(field)
        }
    }

    pub fn metric(field: impl Into<String>, metric: MetricKind) -> Self {
        let field = field.into();
        Self {
            name: format!("{field}_{}", metric.as_str()),
            kind: AggregationKind::Metric(metric),
            ..Self::terms(field)
        }
    }

    pub fn composite(name: impl Into<String>, sources: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            kind: AggregationKind::Composite,
            target: AggregationTarget::Fields(sources),
            bucket_limit: None,
            interval: None,
            after_key: None,
        }
    }

    pub fn filtered(field: impl Into<String>, groups: Vec<FilterGroup>) -> Self {
        Self {
            kind: AggregationKind::Filter(groups),
            ..Self::terms(field)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bucket_limit(mut self, limit: u32) -> Self {
        self.bucket_limit = Some(limit);
        self
    }

    pub fn with_after_key(mut self, after: JsonValue) -> Self {
        self.after_key = Some(after);
        self
    }

    pub fn primary_field(&self) -> Option<&str> {
        match &self.target {
            AggregationTarget::Field(f) => Some(f),
            AggregationTarget::Fields(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    #[default]
    BestFields,
    MostFields,
    CrossFields,
    Phrase,
    PhrasePrefix,
    BoolPrefix,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::BestFields => "best_fields",
            MatchType::MostFields => "most_fields",
            MatchType::CrossFields => "cross_fields",
            MatchType::Phrase => "phrase",
            MatchType::PhrasePrefix => "phrase_prefix",
            MatchType::BoolPrefix => "bool_prefix",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullTextClause {
    pub fields: Vec<String>,
    pub value: String,
    #[serde(default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
}

/// One representative document per distinct `field` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapseSpec {
    pub field: String,
    /// Hashed multi-value field counted to get true totals under collapsing.
    pub cardinality_field: String,
    #[serde(default)]
    pub inner_hits: Option<String>,
}

/// Everything one compilation consumes. Relational-only clauses (joins, raw
/// selects, distinct, group-by) are rejected by the document compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub filter_groups: Vec<FilterGroup>,
    pub post_filter_groups: Vec<FilterGroup>,
    pub sorts: Vec<SortSpec>,
    pub pagination: PaginationSpec,
    pub aggregations: Vec<AggregationSpec>,
    pub full_text: Vec<FullTextClause>,
    pub include_fields: Vec<String>,
    pub exclude_fields: Vec<String>,
    /// Last id seen by the caller; switches to keyset pagination.
    pub scroll_after: Option<Value>,
    pub collapse: Option<CollapseSpec>,
    pub joins: Vec<JoinSpec>,
    pub raw_selects: Vec<String>,
    pub distinct: bool,
    pub group_by: Vec<String>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_filters(&self) -> bool {
        self.filter_groups.iter().any(|g| !g.is_empty())
    }

    pub fn filter(mut self, group: FilterGroup) -> Self {
        self.filter_groups.push(group);
        self
    }

    pub fn post_filter(mut self, group: FilterGroup) -> Self {
        self.post_filter_groups.push(group);
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn paginate(mut self, pagination: PaginationSpec) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn aggregate(mut self, aggregation: AggregationSpec) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn collapse(mut self, collapse: CollapseSpec) -> Self {
        self.collapse = Some(collapse);
        self
    }

    /// Builds criteria from the wire contract.
    pub fn from_input(input: CriteriaInput) -> Result<Self, GateError> {
        let mut criteria = SearchCriteria {
            filter_groups: convert_groups(input.filter)?,
            post_filter_groups: convert_groups(input.post_filter)?,
            sorts: input.sort,
            exclude_fields: input.exclude_fields,
            ..Default::default()
        };
        if let Some(p) = input.pagination {
            criteria.pagination = PaginationSpec::new(p.page, p.limit)?;
        }
        if let Some(aggregation) = input.aggregation {
            criteria.aggregations = aggregation.into_specs()?;
        }
        criteria.full_text = input.full_text;
        Ok(criteria)
    }

    pub fn from_json(input: &JsonValue) -> Result<Self, GateError> {
        let parsed: CriteriaInput = serde_json::from_value(input.clone())
            .map_err(|e| GateError::Decode(e.to_string()))?;
        Self::from_input(parsed)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CriteriaInput {
    #[serde(default)]
    pub filter: Vec<GroupInput>,
    #[serde(default)]
    pub sort: Vec<SortSpec>,
    #[serde(default)]
    pub pagination: Option<PaginationInput>,
    #[serde(default)]
    pub aggregation: Option<AggregationInput>,
    #[serde(default)]
    pub post_filter: Vec<GroupInput>,
    #[serde(default)]
    pub full_text: Vec<FullTextClause>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupInput {
    #[serde(default)]
    pub condition: GroupLogic,
    pub group: Vec<ConditionInput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionInput {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PaginationInput {
    pub page: u32,
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AggregationInput {
    Field(String),
    Fields(Vec<String>),
    Typed(BTreeMap<String, Vec<AggregationTargetInput>>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AggregationTargetInput {
    Field(String),
    Aliased(BTreeMap<String, String>),
}

impl AggregationInput {
    pub fn into_specs(self) -> Result<Vec<AggregationSpec>, GateError> {
        match self {
            AggregationInput::Field(field) => Ok(vec![AggregationSpec::terms(field)]),
            AggregationInput::Fields(fields) => {
                Ok(fields.into_iter().map(AggregationSpec::terms).collect())
            }
            AggregationInput::Typed(by_type) => {
                let mut specs = Vec::new();
                for (kind, targets) in by_type {
                    for target in targets {
                        let (name, field) = match target {
                            AggregationTargetInput::Field(f) => (f.clone(), f),
                            AggregationTargetInput::Aliased(map) => {
                                if map.len() != 1 {
                                    return Err(GateError::InvalidFilter(format!(
                                        "aliased '{kind}' aggregation needs exactly one alias, got {}",
                                        map.len()
                                    )));
                                }
                                match map.into_iter().next() {
                                    Some(entry) => entry,
                                    None => continue,
                                }
                            }
                        };
                        let spec = match kind.as_str() {
                            "terms" => AggregationSpec::terms(field),
                            "histogram" => AggregationSpec::histogram(field, None),
                            "avg" => AggregationSpec::metric(field, MetricKind::Avg),
                            "min" => AggregationSpec::metric(field, MetricKind::Min),
                            "max" => AggregationSpec::metric(field, MetricKind::Max),
                            "sum" => AggregationSpec::metric(field, MetricKind::Sum),
                            "stats" => AggregationSpec::metric(field, MetricKind::Stats),
                            "value_count" => {
                                AggregationSpec::metric(field, MetricKind::ValueCount)
                            }
                            "composite" => AggregationSpec::composite(
                                name.clone(),
                                BTreeMap::from([(name.clone(), field)]),
                            ),
                            other => {
                                return Err(GateError::InvalidFilter(format!(
                                    "unknown aggregation type '{other}'"
                                )));
                            }
                        };
                        specs.push(spec.named(name));
                    }
                }
                Ok(specs)
            }
        }
    }
}

fn convert_groups(groups: Vec<GroupInput>) -> Result<Vec<FilterGroup>, GateError> {
    groups
        .into_iter()
        .filter(|g| !g.group.is_empty())
        .map(|g| {
            let conditions = g
                .group
                .into_iter()
                .map(convert_condition)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FilterGroup::new(g.condition, conditions))
        })
        .collect()
}

fn convert_condition(input: ConditionInput) -> Result<FilterCondition, GateError> {
    let Some(operator) = FilterOperator::parse(&input.operator) else {
        return Err(GateError::UnknownOperator {
            field: input.field,
            operator: input.operator,
        });
    };
    let value = match (operator, input.value) {
        (_, None) | (_, Some(JsonValue::Null)) => FilterValue::Absent,
        (op, Some(_)) if !op.takes_value() => FilterValue::Absent,
        (FilterOperator::Between, Some(JsonValue::Object(map))) => FilterValue::Range {
            from: map.get("from").map(Value::from_json).unwrap_or(Value::Null),
            to: map.get("to").map(Value::from_json).unwrap_or(Value::Null),
        },
        (op, Some(JsonValue::Array(items))) if op.takes_list() => {
            FilterValue::List(items.iter().map(Value::from_json).collect())
        }
        (_, Some(other)) => FilterValue::Scalar(Value::from_json(&other)),
    };
    FilterCondition::new(input.field, operator, value)
}
