use crate::catalog::types::Value;
use crate::error::GateError;
use crate::filter::{FilterCondition, FilterOperator, FilterValue};
use serde_json::Value as JsonValue;
use tracing::warn;

/// The caller-facing shapes a single field filter can take.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    /// `field = scalar`
    Equality(Value),
    /// `field = {from, to}`; a missing bound turns it into a one-sided range.
    Range {
        from: Option<Value>,
        to: Option<Value>,
    },
    /// `field = {operator: value}`
    OperatorMap(FilterOperator, FilterValue),
    /// `field = [{op1: v1}, {op2: v2}]`, combined with the caller's logic.
    OperatorList(Vec<(FilterOperator, FilterValue)>),
}

impl FieldFilter {
    pub fn eq(value: impl Into<Value>) -> Self {
        FieldFilter::Equality(value.into())
    }

    pub fn range(from: impl Into<Value>, to: impl Into<Value>) -> Self {
        FieldFilter::Range {
            from: Some(from.into()),
            to: Some(to.into()),
        }
    }

    pub fn op(operator: FilterOperator, value: impl Into<Value>) -> Self {
        FieldFilter::OperatorMap(operator, FilterValue::Scalar(value.into()))
    }

    pub fn list(operator: FilterOperator, values: Vec<Value>) -> Self {
        FieldFilter::OperatorMap(operator, FilterValue::List(values))
    }

    pub fn flag(operator: FilterOperator) -> Self {
        FieldFilter::OperatorMap(operator, FilterValue::Absent)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FieldFilter::OperatorList(_))
    }

    /// Parses the dynamic JSON form. Unknown operators are rejected unless
    /// `lenient` is set, in which case the whole structure is matched by
    /// equality against its serialized form and a warning is logged.
    pub fn from_json(field: &str, input: &JsonValue, lenient: bool) -> Result<Self, GateError> {
        match input {
            JsonValue::Null => Err(GateError::InvalidFilter(format!(
                "null filter value for '{field}'"
            ))),
            JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::String(_) => {
                Ok(FieldFilter::Equality(Value::from_json(input)))
            }
            JsonValue::Object(map) => {
                if !map.is_empty() && map.keys().all(|k| k == "from" || k == "to") {
                    return Ok(FieldFilter::Range {
                        from: map.get("from").map(Value::from_json).filter(|v| !v.is_null()),
                        to: map.get("to").map(Value::from_json).filter(|v| !v.is_null()),
                    });
                }
                match parse_operator_entry(field, input)? {
                    Some((op, value)) => Ok(FieldFilter::OperatorMap(op, value)),
                    None => unknown_shape(field, input, lenient),
                }
            }
            JsonValue::Array(items) => {
                if items.iter().all(|item| !item.is_object() && !item.is_array()) {
                    return Ok(FieldFilter::OperatorMap(
                        FilterOperator::In,
                        FilterValue::List(items.iter().map(Value::from_json).collect()),
                    ));
                }
                let mut entries = Vec::with_capacity(items.len());
                for item in items {
                    match parse_operator_entry(field, item)? {
                        Some(entry) => entries.push(entry),
                        None => return unknown_shape(field, input, lenient),
                    }
                }
                Ok(FieldFilter::OperatorList(entries))
            }
        }
    }

    pub fn into_conditions(self, field: &str) -> Result<Vec<FilterCondition>, GateError> {
        match self {
            FieldFilter::Equality(value) => Ok(vec![FilterCondition::new(
                field,
                FilterOperator::Eq,
                FilterValue::Scalar(value),
            )?]),
            FieldFilter::Range { from, to } => {
                let condition = match (from, to) {
                    (Some(from), Some(to)) => FilterCondition::new(
                        field,
                        FilterOperator::Between,
                        FilterValue::Range { from, to },
                    )?,
                    (Some(from), None) => FilterCondition::new(
                        field,
                        FilterOperator::Gte,
                        FilterValue::Scalar(from),
                    )?,
                    (None, Some(to)) => {
                        FilterCondition::new(field, FilterOperator::Lte, FilterValue::Scalar(to))?
                    }
                    (None, None) => {
                        return Err(GateError::InvalidFilter(format!(
                            "range on '{field}' has neither 'from' nor 'to'"
                        )));
                    }
                };
                Ok(vec![condition])
            }
            FieldFilter::OperatorMap(op, value) => Ok(vec![FilterCondition::new(field, op, value)?]),
            FieldFilter::OperatorList(entries) => entries
                .into_iter()
                .map(|(op, value)| FilterCondition::new(field, op, value))
                .collect(),
        }
    }
}

/// `Ok(None)` means the object is not a single recognised `{operator: value}`.
fn parse_operator_entry(
    field: &str,
    input: &JsonValue,
) -> Result<Option<(FilterOperator, FilterValue)>, GateError> {
    let Some(map) = input.as_object() else {
        return Ok(None);
    };
    if map.len() != 1 {
        return Ok(None);
    }
    let Some((key, raw)) = map.iter().next() else {
        return Ok(None);
    };
    let Some(op) = FilterOperator::parse(key) else {
        return Ok(None);
    };
    Ok(Some((op, operator_value(field, op, raw)?)))
}

fn operator_value(field: &str, op: FilterOperator, raw: &JsonValue) -> Result<FilterValue, GateError> {
    if !op.takes_value() {
        return Ok(FilterValue::Absent);
    }
    if raw.is_null() {
        return Ok(FilterValue::Absent);
    }
    match op {
        FilterOperator::Between => {
            let Some(map) = raw.as_object() else {
                return Err(GateError::InvalidFilter(format!(
                    "between on '{field}' expects an object with 'from' and 'to'"
                )));
            };
            Ok(FilterValue::Range {
                from: map.get("from").map(Value::from_json).unwrap_or(Value::Null),
                to: map.get("to").map(Value::from_json).unwrap_or(Value::Null),
            })
        }
        _ if op.takes_list() => match raw.as_array() {
            Some(items) => Ok(FilterValue::List(items.iter().map(Value::from_json).collect())),
            None => Ok(FilterValue::Scalar(Value::from_json(raw))),
        },
        _ => Ok(FilterValue::Scalar(Value::from_json(raw))),
    }
}

fn unknown_shape(field: &str, input: &JsonValue, lenient: bool) -> Result<FieldFilter, GateError> {
    let operator = match input {
        JsonValue::Object(map) => map.keys().cloned().collect::<Vec<_>>().join(","),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(JsonValue::as_object)
            .flat_map(|m| m.keys().cloned())
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    };
    if !lenient {
        return Err(GateError::UnknownOperator {
            field: field.to_string(),
            operator,
        });
    }
    let flattened = input.to_string();
    warn!(
        field,
        operator = %operator,
        value = %flattened,
        "unrecognised filter operator, falling back to equality on serialized input"
    );
    Ok(FieldFilter::Equality(Value::Text(flattened.into())))
}

#[cfg(test)]
mod tests {
    use super::FieldFilter;
    use crate::catalog::types::Value;
    use crate::filter::{FilterOperator, FilterValue};
    use serde_json::json;

    #[test]
    fn parses_the_four_shapes() {
        assert_eq!(
            FieldFilter::from_json("status", &json!("active"), false).expect("scalar"),
            FieldFilter::Equality("active".into())
        );
        assert_eq!(
            FieldFilter::from_json("price", &json!({"from": 5, "to": 10}), false).expect("range"),
            FieldFilter::range(5, 10)
        );
        assert_eq!(
            FieldFilter::from_json("sku", &json!({"in": "a"}), false).expect("op map"),
            FieldFilter::OperatorMap(FilterOperator::In, FilterValue::Scalar("a".into()))
        );
        assert_eq!(
            FieldFilter::from_json("name", &json!([{"like": "a*"}, {"eq": "b"}]), false)
                .expect("op list"),
            FieldFilter::OperatorList(vec![
                (FilterOperator::Like, FilterValue::Scalar("a*".into())),
                (FilterOperator::Eq, FilterValue::Scalar("b".into())),
            ])
        );
    }

    #[test]
    fn unknown_operator_is_rejected_by_default() {
        let err = FieldFilter::from_json("name", &json!({"contains": "x"}), false)
            .expect_err("unknown operator");
        assert_eq!(err.code_str(), "unknown_operator");
    }

    #[test]
    fn lenient_mode_falls_back_to_serialized_equality() {
        let parsed =
            FieldFilter::from_json("name", &json!({"contains": "x"}), true).expect("lenient");
        assert_eq!(
            parsed,
            FieldFilter::Equality(Value::Text(r#"{"contains":"x"}"#.into()))
        );
    }

    #[test]
    fn in_coerces_scalar_to_single_element_list() {
        let conditions = FieldFilter::from_json("sku", &json!({"in": "a"}), false)
            .expect("parse")
            .into_conditions("sku")
            .expect("conditions");
        assert_eq!(conditions[0].value, FilterValue::List(vec!["a".into()]));
    }

    #[test]
    fn one_sided_range_becomes_comparison() {
        let conditions = FieldFilter::from_json("price", &json!({"from": 5}), false)
            .expect("parse")
            .into_conditions("price")
            .expect("conditions");
        assert_eq!(conditions[0].operator, FilterOperator::Gte);
    }

    #[test]
    fn exists_discards_its_flag_value() {
        let conditions = FieldFilter::from_json("note", &json!({"exists": true}), false)
            .expect("parse")
            .into_conditions("note")
            .expect("conditions");
        assert_eq!(conditions[0].value, FilterValue::Absent);
    }
}
