//! Turns a raw search response into rows, a total and typed aggregations,
//! undoing the compiler's wrappers and dropping its bookkeeping.

use crate::document::aggregation::{
    AggregationLayout, AggregationShape, COLLAPSE_CARDINALITY, TOTAL_DISTINCT,
};
use crate::document::compiler::DocumentSearch;
use crate::error::GateError;
use crate::results::{AggregationValue, Aggregations, Bucket, SearchOutcome, StatsValue};
use serde_json::{Map, Value as JsonValue, json};

/// Key under which inner hits are attached to a hydrated row.
pub const INNER_HITS_KEY: &str = "_inner_hits";

pub struct ResponseProcessor<'a> {
    search: &'a DocumentSearch,
    id_field: &'a str,
}

impl<'a> ResponseProcessor<'a> {
    pub fn new(search: &'a DocumentSearch, id_field: &'a str) -> Self {
        Self { search, id_field }
    }

    pub fn process(&self, raw: &JsonValue) -> Result<SearchOutcome, GateError> {
        let hits = raw
            .get("hits")
            .ok_or_else(|| GateError::Decode("search response has no hits".into()))?;
        let rows = hits
            .get("hits")
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().map(|hit| self.hydrate(hit)).collect())
            .unwrap_or_default();
        let mut total = match hits.get("total") {
            Some(JsonValue::Number(n)) => n.as_u64().unwrap_or(0),
            Some(obj) => obj.get("value").and_then(JsonValue::as_u64).unwrap_or(0),
            None => 0,
        };

        let empty = Map::new();
        let raw_aggs = raw
            .get("aggregations")
            .and_then(JsonValue::as_object)
            .unwrap_or(&empty);
        let mut aggregations = Aggregations::new();
        for layout in &self.search.layout {
            if let Some(node) = raw_aggs.get(&layout.name) {
                aggregations.insert(layout.name.clone(), parse_aggregation(layout, node)?);
            }
        }
        if let Some(wrapped) = self.search.total_distinct {
            let mut node = raw_aggs.get(TOTAL_DISTINCT);
            if wrapped {
                node = node.and_then(|n| n.get(TOTAL_DISTINCT));
            }
            if let Some(value) = node.and_then(|n| n.get("value")).and_then(JsonValue::as_u64) {
                total = value;
            }
        }
        Ok(SearchOutcome {
            rows,
            total,
            aggregations,
        })
    }

    fn hydrate(&self, hit: &JsonValue) -> Map<String, JsonValue> {
        let mut row = hit
            .get("_source")
            .and_then(JsonValue::as_object)
            .cloned()
            .unwrap_or_default();
        if !row.contains_key(self.id_field) {
            if let Some(id) = hit.get("_id") {
                row.insert(self.id_field.to_string(), id.clone());
            }
        }
        if let Some(inner) = hit.get("inner_hits").and_then(JsonValue::as_object) {
            let mut attached = Map::new();
            for (name, body) in inner {
                let sources: Vec<JsonValue> = body
                    .pointer("/hits/hits")
                    .and_then(JsonValue::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|h| h.get("_source").cloned())
                            .collect()
                    })
                    .unwrap_or_default();
                attached.insert(name.clone(), JsonValue::Array(sources));
            }
            row.insert(INNER_HITS_KEY.into(), JsonValue::Object(attached));
        }
        row
    }
}

fn parse_aggregation(
    layout: &AggregationLayout,
    node: &JsonValue,
) -> Result<AggregationValue, GateError> {
    let mut node = node;
    let wrappers = [
        layout.facet_wrapped,
        layout.filter_wrapped,
        layout.nested_path.is_some(),
    ];
    for wrapped in wrappers {
        if wrapped {
            node = node.get(&layout.name).ok_or_else(|| {
                GateError::Decode(format!("aggregation '{}' lost its wrapper", layout.name))
            })?;
        }
    }
    Ok(match layout.shape {
        AggregationShape::Buckets => AggregationValue::Buckets(buckets(node)),
        AggregationShape::Composite => AggregationValue::Composite {
            buckets: buckets(node),
            after_key: node.get("after_key").cloned(),
        },
        AggregationShape::Metric => AggregationValue::Metric(node.get("value").and_then(JsonValue::as_f64)),
        AggregationShape::Stats => AggregationValue::Stats(StatsValue {
            count: node.get("count").and_then(JsonValue::as_u64).unwrap_or(0),
            min: node.get("min").and_then(JsonValue::as_f64),
            max: node.get("max").and_then(JsonValue::as_f64),
            avg: node.get("avg").and_then(JsonValue::as_f64),
            sum: node.get("sum").and_then(JsonValue::as_f64).unwrap_or(0.0),
        }),
    })
}

fn buckets(node: &JsonValue) -> Vec<Bucket> {
    node.get("buckets")
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .map(|b| Bucket {
                    key: b.get("key").cloned().unwrap_or(json!(null)),
                    doc_count: b.get("doc_count").and_then(JsonValue::as_u64).unwrap_or(0),
                    distinct_count: b.get(COLLAPSE_CARDINALITY).and_then(|c| {
                        c.get("value")
                            .or_else(|| c.get(COLLAPSE_CARDINALITY).and_then(|r| r.get("value")))
                            .and_then(JsonValue::as_u64)
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}
