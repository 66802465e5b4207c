//! Row-level evaluation of relational expressions, used by the in-memory
//! relational engine.

use crate::catalog::types::{Row, Value};
use crate::query::plan::{Aggregate, ColumnRef, Expr};
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;

const REGEX_CACHE_CAPACITY: usize = 128;

/// Compiled patterns keyed by source text. Invalid patterns are cached as
/// `None` so they fail fast on every row.
static REGEX_CACHE: once_cell::sync::Lazy<parking_lot::Mutex<LruCache<String, Option<Regex>>>> =
    once_cell::sync::Lazy::new(|| {
        let cap = NonZeroUsize::new(REGEX_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        parking_lot::Mutex::new(LruCache::new(cap))
    });

pub fn eval(expr: &Expr, row: &Row) -> bool {
    match expr {
        Expr::Eq(c, v) => cmp_col(row, c, v, Ordering::is_eq),
        Expr::Ne(c, v) => cmp_col(row, c, v, Ordering::is_ne),
        Expr::Lt(c, v) => cmp_col(row, c, v, Ordering::is_lt),
        Expr::Lte(c, v) => cmp_col(row, c, v, Ordering::is_le),
        Expr::Gt(c, v) => cmp_col(row, c, v, Ordering::is_gt),
        Expr::Gte(c, v) => cmp_col(row, c, v, Ordering::is_ge),
        Expr::In(c, values) => column_value(row, c).is_some_and(|rv| {
            values
                .iter()
                .any(|v| compare_values(&rv, v).is_some_and(Ordering::is_eq))
        }),
        // SQL three-valued logic: NULL NOT IN (...) is not true.
        Expr::NotIn(c, values) => column_value(row, c).is_some_and(|rv| {
            !rv.is_null()
                && values
                    .iter()
                    .all(|v| compare_values(&rv, v).is_some_and(Ordering::is_ne))
        }),
        Expr::Between(c, lo, hi) => column_value(row, c).is_some_and(|rv| {
            compare_values(&rv, lo).is_some_and(Ordering::is_ge)
                && compare_values(&rv, hi).is_some_and(Ordering::is_le)
        }),
        Expr::IsNull(c) => column_value(row, c).is_none_or(|rv| rv.is_null()),
        Expr::IsNotNull(c) => column_value(row, c).is_some_and(|rv| !rv.is_null()),
        Expr::Like(c, pattern) => text_value(row, c).is_some_and(|s| like_match(&s, pattern)),
        Expr::NotLike(c, pattern) => text_value(row, c).is_some_and(|s| !like_match(&s, pattern)),
        Expr::Regexp(c, pattern) => {
            text_value(row, c).is_some_and(|s| regex_match(&s, pattern) == Some(true))
        }
        Expr::NotRegexp(c, pattern) => {
            text_value(row, c).is_some_and(|s| regex_match(&s, pattern) == Some(false))
        }
        Expr::JsonContains(c, candidate) => column_json(row, c)
            .is_some_and(|doc| json_contains(&doc, &candidate.to_json())),
        Expr::And(parts) => parts.iter().all(|p| eval(p, row)),
        Expr::Or(parts) => parts.iter().any(|p| eval(p, row)),
        Expr::Not(inner) => !eval(inner, row),
    }
}

fn cmp_col(row: &Row, column: &ColumnRef, value: &Value, accept: fn(Ordering) -> bool) -> bool {
    column_value(row, column).is_some_and(|rv| compare_values(&rv, value).is_some_and(accept))
}

/// Looks a column up by its qualified key first (joined rows carry
/// `alias.column` keys), then by bare name, then drills into JSON.
pub fn column_value(row: &Row, column: &ColumnRef) -> Option<Value> {
    let stored = match &column.qualifier {
        Some(q) => row
            .get(&format!("{q}.{}", column.column))
            .or_else(|| row.get(&column.column)),
        None => row.get(&column.column),
    }?;
    match &column.json_path {
        None => Some(stored.clone()),
        Some(path) => {
            let doc = as_document(stored)?;
            json_path(&doc, path).map(Value::from_json)
        }
    }
}

fn column_json(row: &Row, column: &ColumnRef) -> Option<JsonValue> {
    let target = ColumnRef {
        json_path: None,
        ..column.clone()
    };
    let doc = as_document(&column_value(row, &target)?)?;
    match &column.json_path {
        Some(path) => json_path(&doc, path).cloned(),
        None => Some(doc),
    }
}

fn as_document(value: &Value) -> Option<JsonValue> {
    match value {
        Value::Json(doc) => Some(doc.clone()),
        Value::Text(s) => serde_json::from_str(s).ok(),
        Value::Null => None,
        other => Some(other.to_json()),
    }
}

fn json_path<'a>(doc: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.').try_fold(doc, |node, segment| match node {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn text_value(row: &Row, column: &ColumnRef) -> Option<String> {
    match column_value(row, column)? {
        Value::Null => None,
        Value::Text(s) => Some(s.to_string()),
        other => Some(other.to_key_string()),
    }
}

/// SQL LIKE with `%`, `_` and backslash escapes, case-insensitive like the
/// default MySQL collation.
pub fn like_match(value: &str, pattern: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Tok {
        Any,
        One,
        Lit(char),
    }
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        tokens.push(match ch {
            '%' => Tok::Any,
            '_' => Tok::One,
            '\\' => Tok::Lit(chars.next().unwrap_or('\\')),
            other => Tok::Lit(other),
        });
    }
    let text: Vec<char> = value.chars().flat_map(char::to_lowercase).collect();
    let tokens: Vec<Tok> = tokens
        .into_iter()
        .map(|t| match t {
            Tok::Lit(c) => Tok::Lit(c.to_lowercase().next().unwrap_or(c)),
            other => other,
        })
        .collect();

    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;
    while ti < text.len() {
        if pi < tokens.len() && (tokens[pi] == Tok::One || tokens[pi] == Tok::Lit(text[ti])) {
            ti += 1;
            pi += 1;
            continue;
        }
        if pi < tokens.len() && tokens[pi] == Tok::Any {
            star_pi = Some(pi);
            pi += 1;
            star_ti = ti;
            continue;
        }
        if let Some(saved_pi) = star_pi {
            pi = saved_pi + 1;
            star_ti += 1;
            ti = star_ti;
            continue;
        }
        return false;
    }
    while pi < tokens.len() && tokens[pi] == Tok::Any {
        pi += 1;
    }
    pi == tokens.len()
}

/// `None` when the pattern does not compile.
pub fn regex_match(value: &str, pattern: &str) -> Option<bool> {
    let mut cache = REGEX_CACHE.lock();
    if let Some(compiled) = cache.get(pattern) {
        return compiled.as_ref().map(|re| re.is_match(value));
    }
    let compiled = RegexBuilder::new(pattern).case_insensitive(true).build().ok();
    let result = compiled.as_ref().map(|re| re.is_match(value));
    cache.put(pattern.to_string(), compiled);
    result
}

/// MySQL `JSON_CONTAINS` semantics: arrays contain a candidate when some
/// element does (array candidates need every element contained), objects
/// contain a candidate object key by key, scalars compare by value.
pub fn json_contains(target: &JsonValue, candidate: &JsonValue) -> bool {
    match (target, candidate) {
        (JsonValue::Array(items), JsonValue::Array(wanted)) => wanted
            .iter()
            .all(|w| items.iter().any(|item| json_contains(item, w))),
        (JsonValue::Array(items), scalar) => items.iter().any(|item| json_contains(item, scalar)),
        (JsonValue::Object(map), JsonValue::Object(wanted)) => wanted
            .iter()
            .all(|(k, w)| map.get(k).is_some_and(|v| json_contains(v, w))),
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Ordering between a stored value and a literal, coercing numeric text the
/// way the relational engine does. `None` when either side is NULL.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(t), n @ (Value::Integer(_) | Value::Float(_))) => {
            let parsed = t.trim().parse::<f64>().ok()?;
            parsed.partial_cmp(&n.as_f64()?)
        }
        (n @ (Value::Integer(_) | Value::Float(_)), Value::Text(t)) => {
            let parsed = t.trim().parse::<f64>().ok()?;
            n.as_f64()?.partial_cmp(&parsed)
        }
        (Value::Boolean(b), Value::Integer(i)) => Some(i64::from(*b).cmp(i)),
        (Value::Integer(i), Value::Boolean(b)) => Some(i.cmp(&i64::from(*b))),
        (Value::Json(doc), other) if !doc.is_array() && !doc.is_object() => {
            compare_values(&Value::from_json(doc), other)
        }
        (other, Value::Json(doc)) if !doc.is_array() && !doc.is_object() => {
            compare_values(other, &Value::from_json(doc))
        }
        _ => Some(left.cmp(right)),
    }
}

/// Evaluates one aggregate over a group of rows.
pub fn aggregate(aggregate: &Aggregate, rows: &[&Row]) -> Value {
    match aggregate {
        Aggregate::Count => Value::Integer(rows.len() as i64),
        Aggregate::CountDistinct(c) => {
            let distinct: BTreeSet<Value> = rows
                .iter()
                .filter_map(|r| column_value(r, c))
                .filter(|v| !v.is_null())
                .collect();
            Value::Integer(distinct.len() as i64)
        }
        Aggregate::Sum(c) => {
            let values = non_null(rows, c);
            if values.is_empty() {
                return Value::Null;
            }
            if values.iter().all(|v| matches!(v, Value::Integer(_))) {
                Value::Integer(values.iter().filter_map(|v| match v {
                    Value::Integer(i) => Some(*i),
                    _ => None,
                }).sum())
            } else {
                Value::Float(values.iter().filter_map(numeric).sum())
            }
        }
        Aggregate::Avg(c) => {
            let values: Vec<f64> = non_null(rows, c).iter().filter_map(numeric).collect();
            if values.is_empty() {
                Value::Null
            } else {
                Value::Float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        Aggregate::Min(c) => non_null(rows, c).into_iter().min().unwrap_or(Value::Null),
        Aggregate::Max(c) => non_null(rows, c).into_iter().max().unwrap_or(Value::Null),
    }
}

fn non_null(rows: &[&Row], column: &ColumnRef) -> Vec<Value> {
    rows.iter()
        .filter_map(|r| column_value(r, column))
        .filter(|v| !v.is_null())
        .collect()
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Text(t) => t.trim().parse().ok(),
        other => other.as_f64(),
    }
}
