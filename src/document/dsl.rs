//! Typed query tree for the document store's JSON DSL.

use crate::criteria::MatchType;
use crate::error::GateError;
use serde_json::{Map, Value as JsonValue, json};

#[derive(Debug, Clone, PartialEq)]
pub enum DocQuery {
    MatchAll,
    Term {
        field: String,
        value: JsonValue,
    },
    Terms {
        field: String,
        values: Vec<JsonValue>,
    },
    Range {
        field: String,
        bounds: RangeBounds,
    },
    Exists {
        field: String,
    },
    /// `*` and `?` wildcards, anchored to the whole value.
    Wildcard {
        field: String,
        pattern: String,
        case_insensitive: bool,
    },
    /// Anchored to the whole value.
    Regexp {
        field: String,
        pattern: String,
        case_insensitive: bool,
    },
    MultiMatch {
        query: String,
        fields: Vec<String>,
        match_type: MatchType,
        parameters: Map<String, JsonValue>,
    },
    Nested {
        path: String,
        query: Box<DocQuery>,
        inner_hits: Option<JsonValue>,
    },
    Bool(BoolQuery),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeBounds {
    pub gt: Option<JsonValue>,
    pub gte: Option<JsonValue>,
    pub lt: Option<JsonValue>,
    pub lte: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoolQuery {
    pub must: Vec<DocQuery>,
    pub filter: Vec<DocQuery>,
    pub should: Vec<DocQuery>,
    pub must_not: Vec<DocQuery>,
    pub minimum_should_match: Option<u32>,
}

impl BoolQuery {
    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
            && self.filter.is_empty()
            && self.should.is_empty()
            && self.must_not.is_empty()
    }

    pub fn any_of(should: Vec<DocQuery>) -> Self {
        Self {
            should,
            minimum_should_match: Some(1),
            ..Self::default()
        }
    }

    /// Collapses to `match_all` when empty and to the lone clause when the
    /// bool only wraps a single positive filter.
    pub fn into_query(mut self) -> DocQuery {
        if self.is_empty() {
            return DocQuery::MatchAll;
        }
        if self.filter.len() == 1
            && self.must.is_empty()
            && self.should.is_empty()
            && self.must_not.is_empty()
        {
            if let Some(only) = self.filter.pop() {
                return only;
            }
        }
        DocQuery::Bool(self)
    }

    fn to_json(&self) -> JsonValue {
        let mut body = Map::new();
        for (key, clauses) in [
            ("must", &self.must),
            ("filter", &self.filter),
            ("should", &self.should),
            ("must_not", &self.must_not),
        ] {
            if !clauses.is_empty() {
                body.insert(
                    key.to_string(),
                    JsonValue::Array(clauses.iter().map(DocQuery::to_json).collect()),
                );
            }
        }
        if let Some(n) = self.minimum_should_match {
            body.insert("minimum_should_match".into(), json!(n));
        }
        json!({ "bool": body })
    }
}

impl DocQuery {
    pub fn term(field: impl Into<String>, value: JsonValue) -> Self {
        DocQuery::Term {
            field: field.into(),
            value,
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        DocQuery::Exists {
            field: field.into(),
        }
    }

    pub fn negate(self) -> Self {
        DocQuery::Bool(BoolQuery {
            must_not: vec![self],
            ..BoolQuery::default()
        })
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            DocQuery::MatchAll => json!({ "match_all": {} }),
            DocQuery::Term { field, value } => json!({ "term": { field: { "value": value } } }),
            DocQuery::Terms { field, values } => json!({ "terms": { field: values } }),
            DocQuery::Range { field, bounds } => {
                let mut body = Map::new();
                for (key, bound) in [
                    ("gt", &bounds.gt),
                    ("gte", &bounds.gte),
                    ("lt", &bounds.lt),
                    ("lte", &bounds.lte),
                ] {
                    if let Some(v) = bound {
                        body.insert(key.to_string(), v.clone());
                    }
                }
                json!({ "range": { field: body } })
            }
            DocQuery::Exists { field } => json!({ "exists": { "field": field } }),
            DocQuery::Wildcard {
                field,
                pattern,
                case_insensitive,
            } => json!({
                "wildcard": { field: { "value": pattern, "case_insensitive": case_insensitive } }
            }),
            DocQuery::Regexp {
                field,
                pattern,
                case_insensitive,
            } => json!({
                "regexp": { field: { "value": pattern, "case_insensitive": case_insensitive } }
            }),
            DocQuery::MultiMatch {
                query,
                fields,
                match_type,
                parameters,
            } => {
                let mut body = parameters.clone();
                body.insert("query".into(), json!(query));
                body.insert("fields".into(), json!(fields));
                body.insert("type".into(), json!(match_type.as_str()));
                json!({ "multi_match": body })
            }
            DocQuery::Nested {
                path,
                query,
                inner_hits,
            } => {
                let mut body = Map::new();
                body.insert("path".into(), json!(path));
                body.insert("query".into(), query.to_json());
                if let Some(inner) = inner_hits {
                    body.insert("inner_hits".into(), inner.clone());
                }
                json!({ "nested": body })
            }
            DocQuery::Bool(b) => b.to_json(),
        }
    }

    /// Parses the subset of the DSL this crate emits.
    pub fn from_json(input: &JsonValue) -> Result<Self, GateError> {
        let (kind, body) = single_entry(input)?;
        match kind {
            "match_all" => Ok(DocQuery::MatchAll),
            "term" => {
                let (field, spec) = single_entry(body)?;
                let value = match spec {
                    JsonValue::Object(map) if map.contains_key("value") => map["value"].clone(),
                    other => other.clone(),
                };
                Ok(DocQuery::term(field, value))
            }
            "terms" => {
                let (field, values) = single_entry(body)?;
                let values = values
                    .as_array()
                    .cloned()
                    .ok_or_else(|| decode(format!("terms on '{field}' needs an array")))?;
                Ok(DocQuery::Terms {
                    field: field.to_string(),
                    values,
                })
            }
            "range" => {
                let (field, spec) = single_entry(body)?;
                let bound = |key: &str| spec.get(key).cloned();
                Ok(DocQuery::Range {
                    field: field.to_string(),
                    bounds: RangeBounds {
                        gt: bound("gt"),
                        gte: bound("gte"),
                        lt: bound("lt"),
                        lte: bound("lte"),
                    },
                })
            }
            "exists" => {
                let field = body
                    .get("field")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| decode("exists needs a field".into()))?;
                Ok(DocQuery::exists(field))
            }
            "wildcard" | "regexp" => {
                let (field, spec) = single_entry(body)?;
                let (pattern, case_insensitive) = match spec {
                    JsonValue::String(s) => (s.clone(), false),
                    other => (
                        other
                            .get("value")
                            .and_then(JsonValue::as_str)
                            .ok_or_else(|| decode(format!("{kind} on '{field}' needs a value")))?
                            .to_string(),
                        other
                            .get("case_insensitive")
                            .and_then(JsonValue::as_bool)
                            .unwrap_or(false),
                    ),
                };
                let field = field.to_string();
                Ok(if kind == "wildcard" {
                    DocQuery::Wildcard {
                        field,
                        pattern,
                        case_insensitive,
                    }
                } else {
                    DocQuery::Regexp {
                        field,
                        pattern,
                        case_insensitive,
                    }
                })
            }
            "multi_match" => {
                let mut parameters = body
                    .as_object()
                    .cloned()
                    .ok_or_else(|| decode("multi_match needs an object".into()))?;
                let query = parameters
                    .remove("query")
                    .and_then(|q| q.as_str().map(str::to_string))
                    .ok_or_else(|| decode("multi_match needs a query".into()))?;
                let fields = parameters
                    .remove("fields")
                    .map(serde_json::from_value::<Vec<String>>)
                    .transpose()
                    .map_err(|e| decode(e.to_string()))?
                    .unwrap_or_default();
                let match_type = parameters
                    .remove("type")
                    .map(serde_json::from_value::<MatchType>)
                    .transpose()
                    .map_err(|e| decode(e.to_string()))?
                    .unwrap_or_default();
                Ok(DocQuery::MultiMatch {
                    query,
                    fields,
                    match_type,
                    parameters,
                })
            }
            "nested" => {
                let path = body
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| decode("nested needs a path".into()))?;
                let query = body
                    .get("query")
                    .ok_or_else(|| decode("nested needs a query".into()))?;
                Ok(DocQuery::Nested {
                    path: path.to_string(),
                    query: Box::new(DocQuery::from_json(query)?),
                    inner_hits: body.get("inner_hits").cloned(),
                })
            }
            "bool" => {
                let clauses = |key: &str| -> Result<Vec<DocQuery>, GateError> {
                    match body.get(key) {
                        None => Ok(Vec::new()),
                        Some(JsonValue::Array(items)) => {
                            items.iter().map(DocQuery::from_json).collect()
                        }
                        Some(single) => Ok(vec![DocQuery::from_json(single)?]),
                    }
                };
                Ok(DocQuery::Bool(BoolQuery {
                    must: clauses("must")?,
                    filter: clauses("filter")?,
                    should: clauses("should")?,
                    must_not: clauses("must_not")?,
                    minimum_should_match: body
                        .get("minimum_should_match")
                        .and_then(JsonValue::as_u64)
                        .map(|n| n as u32),
                }))
            }
            other => Err(decode(format!("unsupported query type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceFilter {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

/// A complete search body plus the index it targets.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    pub query: DocQuery,
    pub post_filter: Option<DocQuery>,
    pub sort: Vec<JsonValue>,
    pub from: u64,
    pub size: u64,
    pub search_after: Option<Vec<JsonValue>>,
    pub source: Option<SourceFilter>,
    pub aggs: Map<String, JsonValue>,
    pub collapse: Option<JsonValue>,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            query: DocQuery::MatchAll,
            post_filter: None,
            sort: Vec::new(),
            from: 0,
            size: 0,
            search_after: None,
            source: None,
            aggs: Map::new(),
            collapse: None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut body = Map::new();
        body.insert("query".into(), self.query.to_json());
        body.insert("from".into(), json!(self.from));
        body.insert("size".into(), json!(self.size));
        body.insert("track_total_hits".into(), json!(true));
        if !self.sort.is_empty() {
            body.insert("sort".into(), JsonValue::Array(self.sort.clone()));
        }
        if let Some(post) = &self.post_filter {
            body.insert("post_filter".into(), post.to_json());
        }
        if let Some(after) = &self.search_after {
            body.insert("search_after".into(), JsonValue::Array(after.clone()));
        }
        if let Some(source) = &self.source {
            body.insert(
                "_source".into(),
                json!({ "includes": source.includes, "excludes": source.excludes }),
            );
        }
        if !self.aggs.is_empty() {
            body.insert("aggs".into(), JsonValue::Object(self.aggs.clone()));
        }
        if let Some(collapse) = &self.collapse {
            body.insert("collapse".into(), collapse.clone());
        }
        JsonValue::Object(body)
    }
}

fn single_entry(input: &JsonValue) -> Result<(&str, &JsonValue), GateError> {
    match input.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| decode("empty clause".into())),
        _ => Err(decode(format!("expected a single-key object, got {input}"))),
    }
}

fn decode(message: String) -> GateError {
    GateError::Decode(message)
}

#[cfg(test)]
mod tests {
    use super::{BoolQuery, DocQuery, RangeBounds};
    use serde_json::json;

    #[test]
    fn bool_query_omits_empty_clauses() {
        let query = DocQuery::Bool(BoolQuery {
            filter: vec![DocQuery::term("status", json!("active"))],
            must_not: vec![DocQuery::exists("deleted_at")],
            ..BoolQuery::default()
        });
        assert_eq!(
            query.to_json(),
            json!({"bool": {
                "filter": [{"term": {"status": {"value": "active"}}}],
                "must_not": [{"exists": {"field": "deleted_at"}}]
            }})
        );
    }

    #[test]
    fn parses_what_it_emits() {
        let query = DocQuery::Bool(BoolQuery {
            filter: vec![
                DocQuery::Range {
                    field: "price".into(),
                    bounds: RangeBounds {
                        gte: Some(json!(10)),
                        lte: Some(json!(20)),
                        ..RangeBounds::default()
                    },
                },
                DocQuery::Nested {
                    path: "variants".into(),
                    query: Box::new(DocQuery::Wildcard {
                        field: "variants.sku".into(),
                        pattern: "ab*".into(),
                        case_insensitive: true,
                    }),
                    inner_hits: Some(json!({})),
                },
            ],
            should: vec![DocQuery::MatchAll],
            minimum_should_match: Some(1),
            ..BoolQuery::default()
        });
        assert_eq!(DocQuery::from_json(&query.to_json()).expect("parse"), query);
    }

    #[test]
    fn lone_filter_unwraps() {
        let only = DocQuery::term("a", json!(1));
        let bool_query = BoolQuery {
            filter: vec![only.clone()],
            ..BoolQuery::default()
        };
        assert_eq!(bool_query.into_query(), only);
        assert_eq!(BoolQuery::default().into_query(), DocQuery::MatchAll);
    }
}
