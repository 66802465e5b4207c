pub mod builder;
pub mod input;

pub use builder::FilterGroupBuilder;
pub use input::FieldFilter;

use crate::catalog::types::Value;
use crate::error::GateError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Between,
    Like,
    NotLike,
    Regexp,
    NotRegexp,
    Exists,
    NotExists,
    Lt,
    Gt,
    Lte,
    Gte,
    NotNull,
    InOrLikes,
}

impl FilterOperator {
    pub const ALL: [FilterOperator; 17] = [
        FilterOperator::Eq,
        FilterOperator::Neq,
        FilterOperator::In,
        FilterOperator::NotIn,
        FilterOperator::Between,
        FilterOperator::Like,
        FilterOperator::NotLike,
        FilterOperator::Regexp,
        FilterOperator::NotRegexp,
        FilterOperator::Exists,
        FilterOperator::NotExists,
        FilterOperator::Lt,
        FilterOperator::Gt,
        FilterOperator::Lte,
        FilterOperator::Gte,
        FilterOperator::NotNull,
        FilterOperator::InOrLikes,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Neq => "neq",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Between => "between",
            FilterOperator::Like => "like",
            FilterOperator::NotLike => "not_like",
            FilterOperator::Regexp => "regexp",
            FilterOperator::NotRegexp => "not_regexp",
            FilterOperator::Exists => "exists",
            FilterOperator::NotExists => "not_exists",
            FilterOperator::Lt => "lt",
            FilterOperator::Gt => "gt",
            FilterOperator::Lte => "lte",
            FilterOperator::Gte => "gte",
            FilterOperator::NotNull => "not_null",
            FilterOperator::InOrLikes => "in_or_likes",
        }
    }

    /// Case-insensitive lookup of the wire name.
    pub fn parse(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        Self::ALL.into_iter().find(|op| op.as_str() == lowered)
    }

    pub fn takes_value(self) -> bool {
        !matches!(
            self,
            FilterOperator::Exists | FilterOperator::NotExists | FilterOperator::NotNull
        )
    }

    pub fn takes_list(self) -> bool {
        matches!(
            self,
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::InOrLikes
        )
    }
}

impl std::fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterValue {
    Absent,
    Scalar(Value),
    List(Vec<Value>),
    Range { from: Value, to: Value },
}

impl FilterValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FilterValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            FilterValue::List(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_range(&self) -> Option<(&Value, &Value)> {
        match self {
            FilterValue::Range { from, to } => Some((from, to)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl FilterCondition {
    /// Validates the operator/value pairing. Scalars given to list operators
    /// become single-element lists.
    pub fn new(
        field: impl Into<String>,
        operator: FilterOperator,
        value: FilterValue,
    ) -> Result<Self, GateError> {
        let field = field.into();
        if field.is_empty() {
            return Err(GateError::InvalidFilter("field name is empty".into()));
        }
        let value = match (operator, value) {
            (op, FilterValue::Absent) if !op.takes_value() => FilterValue::Absent,
            (op, _) if !op.takes_value() => {
                return Err(GateError::InvalidFilter(format!(
                    "operator '{op}' on '{field}' takes no value"
                )));
            }
            (op, FilterValue::Absent) => {
                return Err(GateError::InvalidFilter(format!(
                    "operator '{op}' on '{field}' requires a value"
                )));
            }
            (FilterOperator::Between, FilterValue::Range { from, to }) => {
                if from.is_null() || to.is_null() {
                    return Err(GateError::InvalidFilter(format!(
                        "between on '{field}' requires both 'from' and 'to'"
                    )));
                }
                FilterValue::Range { from, to }
            }
            (FilterOperator::Between, _) => {
                return Err(GateError::InvalidFilter(format!(
                    "between on '{field}' requires a from/to range"
                )));
            }
            (op, FilterValue::Scalar(v)) if op.takes_list() => FilterValue::List(vec![v]),
            (op, FilterValue::List(values)) if op.takes_list() => {
                if values.is_empty() {
                    return Err(GateError::InvalidFilter(format!(
                        "operator '{op}' on '{field}' requires at least one value"
                    )));
                }
                FilterValue::List(values)
            }
            (_, FilterValue::Scalar(v)) => FilterValue::Scalar(v),
            (op, other) => {
                return Err(GateError::InvalidFilter(format!(
                    "operator '{op}' on '{field}' does not accept {other:?}"
                )));
            }
        };
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Eq,
            value: FilterValue::Scalar(value.into()),
        }
    }

    pub fn in_list(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::In,
            value: FilterValue::List(values),
        }
    }

    pub fn between(field: impl Into<String>, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator: FilterOperator::Between,
            value: FilterValue::Range {
                from: from.into(),
                to: to.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupLogic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub logic: GroupLogic,
    pub conditions: Vec<FilterCondition>,
}

impl FilterGroup {
    pub fn new(logic: GroupLogic, conditions: Vec<FilterCondition>) -> Self {
        Self { logic, conditions }
    }

    pub fn and(conditions: Vec<FilterCondition>) -> Self {
        Self::new(GroupLogic::And, conditions)
    }

    pub fn or(conditions: Vec<FilterCondition>) -> Self {
        Self::new(GroupLogic::Or, conditions)
    }

    /// The declared logic only matters once there is something to combine.
    pub fn effective_logic(&self) -> GroupLogic {
        if self.conditions.len() < 2 {
            GroupLogic::And
        } else {
            self.logic
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|c| c.field.as_str())
    }
}

/// Groups with every condition on an `excluded` field removed; groups left
/// empty are dropped.
pub fn without_fields(groups: &[FilterGroup], excluded: &BTreeSet<String>) -> Vec<FilterGroup> {
    groups
        .iter()
        .map(|g| FilterGroup {
            logic: g.logic,
            conditions: g
                .conditions
                .iter()
                .filter(|c| !excluded.contains(&c.field))
                .cloned()
                .collect(),
        })
        .filter(|g| !g.is_empty())
        .collect()
}
