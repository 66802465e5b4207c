//! Backend-independent search output.

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub key: JsonValue,
    pub doc_count: u64,
    /// Distinct collapse keys inside the bucket, when collapsing is active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distinct_count: Option<u64>,
}

impl Bucket {
    pub fn new(key: JsonValue, doc_count: u64) -> Self {
        Self {
            key,
            doc_count,
            distinct_count: None,
        }
    }

    /// The count a caller should display: distinct keys under collapsing,
    /// raw document count otherwise.
    pub fn effective_count(&self) -> u64 {
        self.distinct_count.unwrap_or(self.doc_count)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsValue {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregationValue {
    Buckets(Vec<Bucket>),
    Metric(Option<f64>),
    Stats(StatsValue),
    Composite {
        buckets: Vec<Bucket>,
        after_key: Option<JsonValue>,
    },
}

impl AggregationValue {
    pub fn buckets(&self) -> &[Bucket] {
        match self {
            AggregationValue::Buckets(b) | AggregationValue::Composite { buckets: b, .. } => b,
            _ => &[],
        }
    }

    pub fn metric(&self) -> Option<f64> {
        match self {
            AggregationValue::Metric(v) => *v,
            _ => None,
        }
    }
}

pub type Aggregations = BTreeMap<String, AggregationValue>;

/// One executed search: raw rows in result order, the total matching count
/// (before paging) and processed aggregations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOutcome {
    pub rows: Vec<Map<String, JsonValue>>,
    pub total: u64,
    pub aggregations: Aggregations,
}

#[cfg(test)]
mod tests {
    use super::{AggregationValue, Bucket};
    use serde_json::json;

    #[test]
    fn effective_count_prefers_distinct() {
        let mut bucket = Bucket::new(json!("acme"), 7);
        assert_eq!(bucket.effective_count(), 7);
        bucket.distinct_count = Some(3);
        assert_eq!(bucket.effective_count(), 3);
    }

    #[test]
    fn accessors_ignore_other_shapes() {
        let metric = AggregationValue::Metric(Some(2.5));
        assert!(metric.buckets().is_empty());
        assert_eq!(metric.metric(), Some(2.5));
        let buckets = AggregationValue::Buckets(vec![Bucket::new(json!(1), 1)]);
        assert_eq!(buckets.buckets().len(), 1);
        assert_eq!(buckets.metric(), None);
    }
}
