//! Aggregation tree construction for the document store: bucket sizing,
//! nested wrapping, collapse cardinality and facet exclusion.

use crate::criteria::{
    AggregationKind, AggregationSpec, AggregationTarget, MetricKind, SearchCriteria,
};
use crate::document::compiler::DocumentCompiler;
use crate::error::GateError;
use crate::filter::without_fields;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeSet;

/// Per-bucket distinct count of collapse keys.
pub const COLLAPSE_CARDINALITY: &str = "_collapse_cardinality";
/// Top-level distinct count replacing the hit total under collapsing.
pub const TOTAL_DISTINCT: &str = "_total_distinct";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationShape {
    Buckets,
    Metric,
    Stats,
    Composite,
}

/// How one requested aggregation was wrapped, outermost first: facet filter,
/// filter-kind restriction, nested context, then the core aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationLayout {
    pub name: String,
    pub shape: AggregationShape,
    pub facet_wrapped: bool,
    pub filter_wrapped: bool,
    pub nested_path: Option<String>,
}

pub type BuiltAggregations = (Map<String, JsonValue>, Vec<AggregationLayout>, Option<bool>);

pub fn build_aggregations(
    compiler: &DocumentCompiler<'_>,
    criteria: &SearchCriteria,
) -> Result<BuiltAggregations, GateError> {
    let mut aggs = Map::new();
    let mut layout = Vec::with_capacity(criteria.aggregations.len());
    let cardinality_field = criteria.collapse.as_ref().map(|c| c.cardinality_field.as_str());

    for spec in &criteria.aggregations {
        let (node, entry) = build_one(compiler, criteria, spec, cardinality_field)?;
        aggs.insert(spec.name.clone(), node);
        layout.push(entry);
    }

    let total_distinct = match cardinality_field {
        Some(field) => {
            let cardinality = json!({ "cardinality": { "field": field } });
            let wrapped = match compiler.compile_groups(&criteria.post_filter_groups, false)? {
                Some(post) => {
                    aggs.insert(
                        TOTAL_DISTINCT.into(),
                        json!({
                            "filter": post.to_json(),
                            "aggs": { TOTAL_DISTINCT: cardinality }
                        }),
                    );
                    true
                }
                None => {
                    aggs.insert(TOTAL_DISTINCT.into(), cardinality);
                    false
                }
            };
            Some(wrapped)
        }
        None => None,
    };
    Ok((aggs, layout, total_distinct))
}

fn build_one(
    compiler: &DocumentCompiler<'_>,
    criteria: &SearchCriteria,
    spec: &AggregationSpec,
    cardinality_field: Option<&str>,
) -> Result<(JsonValue, AggregationLayout), GateError> {
    let entity = compiler.entity();
    let config = compiler.config();
    let nested_path = nested_path_for(compiler, spec)?;

    let (mut core, shape) = match (&spec.kind, &spec.target) {
        (AggregationKind::Terms | AggregationKind::Filter(_), AggregationTarget::Field(field)) => {
            let size = spec
                .bucket_limit
                .unwrap_or_else(|| config.bucket_size_for(field));
            (
                json!({ "terms": { "field": field, "size": size } }),
                AggregationShape::Buckets,
            )
        }
        (AggregationKind::Histogram, AggregationTarget::Field(field)) => {
            let interval = spec.interval.unwrap_or(config.histogram_default_interval);
            (
                json!({ "histogram": {
                    "field": field,
                    "interval": interval,
                    "min_doc_count": 0
                } }),
                AggregationShape::Buckets,
            )
        }
        (AggregationKind::Metric(metric), AggregationTarget::Field(field)) => {
            let shape = match metric {
                MetricKind::Stats => AggregationShape::Stats,
                _ => AggregationShape::Metric,
            };
            (json!({ metric.as_str(): { "field": field } }), shape)
        }
        (AggregationKind::Composite, AggregationTarget::Fields(sources)) => {
            let sources: Vec<JsonValue> = sources
                .iter()
                .map(|(alias, field)| json!({ alias: { "terms": { "field": field } } }))
                .collect();
            let mut body = Map::new();
            body.insert(
                "size".into(),
                json!(spec.bucket_limit.unwrap_or(config.composite_page_size)),
            );
            body.insert("sources".into(), JsonValue::Array(sources));
            if let Some(after) = &spec.after_key {
                body.insert("after".into(), after.clone());
            }
            (json!({ "composite": body }), AggregationShape::Composite)
        }
        (kind, target) => {
            return Err(GateError::InvalidFilter(format!(
                "aggregation '{}' of kind {kind:?} cannot target {target:?}",
                spec.name
            )));
        }
    };

    if let Some(field) = cardinality_field {
        if matches!(shape, AggregationShape::Buckets | AggregationShape::Composite) {
            let cardinality = json!({ "cardinality": { "field": field } });
            let sub = if nested_path.is_some() {
                json!({ "reverse_nested": {}, "aggs": { COLLAPSE_CARDINALITY: cardinality } })
            } else {
                cardinality
            };
            if let Some(obj) = core.as_object_mut() {
                obj.insert("aggs".into(), json!({ COLLAPSE_CARDINALITY: sub }));
            }
        }
    }

    let name = spec.name.as_str();
    let mut node = core;
    if let Some(path) = &nested_path {
        node = json!({ "nested": { "path": path }, "aggs": { name: node } });
    }

    let mut filter_wrapped = false;
    if let AggregationKind::Filter(groups) = &spec.kind {
        let restriction = compiler
            .compile_groups(groups, false)?
            .map(|q| q.to_json())
            .unwrap_or_else(|| json!({ "match_all": {} }));
        node = json!({ "filter": restriction, "aggs": { name: node } });
        filter_wrapped = true;
    }

    let mut facet_wrapped = false;
    if !criteria.post_filter_groups.is_empty() {
        let excluded: BTreeSet<String> = spec
            .target
            .fields()
            .into_iter()
            .flat_map(|f| entity.facet_siblings(f))
            .collect();
        let remaining = without_fields(&criteria.post_filter_groups, &excluded);
        if let Some(post) = compiler.compile_groups(&remaining, false)? {
            node = json!({ "filter": post.to_json(), "aggs": { name: node } });
            facet_wrapped = true;
        }
    }

    Ok((
        node,
        AggregationLayout {
            name: spec.name.clone(),
            shape,
            facet_wrapped,
            filter_wrapped,
            nested_path,
        },
    ))
}

/// The nested context every target field shares; mixing contexts in one
/// aggregation cannot be expressed.
fn nested_path_for(
    compiler: &DocumentCompiler<'_>,
    spec: &AggregationSpec,
) -> Result<Option<String>, GateError> {
    let paths: BTreeSet<Option<&str>> = spec
        .target
        .fields()
        .into_iter()
        .map(|f| compiler.entity().nested_path_of(f))
        .collect();
    match paths.len() {
        0 => Ok(None),
        1 => Ok(paths.into_iter().next().flatten().map(str::to_string)),
        _ => Err(GateError::InvalidFilter(format!(
            "aggregation '{}' mixes fields from different nested paths",
            spec.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregationShape, COLLAPSE_CARDINALITY, TOTAL_DISTINCT};
    use crate::catalog::schema::EntityDescriptor;
    use crate::config::GateConfig;
    use crate::criteria::{AggregationSpec, CollapseSpec, MetricKind, SearchCriteria};
    use crate::document::compiler::DocumentCompiler;
    use crate::filter::{FilterCondition, FilterGroup};
    use serde_json::json;

    fn products() -> EntityDescriptor {
        EntityDescriptor::new("product", "products")
            .with_nested_path("variants", false)
            .with_virtual_facet("color", ["color_family", "color_shade"])
    }

    #[test]
    fn bucket_size_prefers_explicit_then_override_then_default() {
        let entity = products();
        let config = GateConfig::default().with_bucket_size("brand", 7);
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new()
            .aggregate(AggregationSpec::terms("brand"))
            .aggregate(AggregationSpec::terms("status").with_bucket_limit(3))
            .aggregate(AggregationSpec::terms("size"));
        let aggs = compiler.compile(&criteria).expect("compile").request.aggs;
        assert_eq!(aggs["brand"]["terms"]["size"], json!(7));
        assert_eq!(aggs["status"]["terms"]["size"], json!(3));
        assert_eq!(aggs["size"]["terms"]["size"], json!(100));
    }

    #[test]
    fn histogram_zero_fills() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria =
            SearchCriteria::new().aggregate(AggregationSpec::histogram("price", None));
        let aggs = compiler.compile(&criteria).expect("compile").request.aggs;
        assert_eq!(
            aggs["price"],
            json!({"histogram": {"field": "price", "interval": 10.0, "min_doc_count": 0}})
        );
    }

    #[test]
    fn nested_fields_are_wrapped() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new()
            .aggregate(AggregationSpec::metric("variants.price", MetricKind::Avg));
        let compiled = compiler.compile(&criteria).expect("compile");
        let name = "variants.price_avg";
        assert_eq!(
            compiled.request.aggs[name],
            json!({"nested": {"path": "variants"}, "aggs": {
                name: {"avg": {"field": "variants.price"}}
            }})
        );
        assert_eq!(compiled.layout[0].nested_path.as_deref(), Some("variants"));
        assert_eq!(compiled.layout[0].shape, AggregationShape::Metric);
    }

    #[test]
    fn collapse_adds_cardinality_bookkeeping() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new()
            .aggregate(AggregationSpec::terms("brand"))
            .collapse(CollapseSpec {
                field: "parent_sku".into(),
                cardinality_field: "parent_sku_hash".into(),
                inner_hits: None,
            });
        let compiled = compiler.compile(&criteria).expect("compile");
        let aggs = &compiled.request.aggs;
        assert_eq!(
            aggs["brand"]["aggs"][COLLAPSE_CARDINALITY],
            json!({"cardinality": {"field": "parent_sku_hash"}})
        );
        assert_eq!(
            aggs[TOTAL_DISTINCT],
            json!({"cardinality": {"field": "parent_sku_hash"}})
        );
        assert_eq!(compiled.total_distinct, Some(false));
        assert_eq!(
            compiled.request.collapse,
            Some(json!({"field": "parent_sku"}))
        );
    }

    #[test]
    fn facet_excludes_own_and_sibling_post_filters() {
        let entity = products();
        let config = GateConfig::default();
        let compiler = DocumentCompiler::new(&entity, &config);
        let criteria = SearchCriteria::new()
            .post_filter(FilterGroup::and(vec![
                FilterCondition::eq("color_family", "red"),
                FilterCondition::eq("brand", "acme"),
            ]))
            .aggregate(AggregationSpec::terms("color_shade"))
            .aggregate(AggregationSpec::terms("brand"));
        let compiled = compiler.compile(&criteria).expect("compile");
        let aggs = &compiled.request.aggs;
        assert_eq!(
            aggs["color_shade"]["filter"],
            json!({"term": {"brand": {"value": "acme"}}})
        );
        assert_eq!(
            aggs["brand"]["filter"],
            json!({"term": {"color_family": {"value": "red"}}})
        );
        assert!(compiled.layout.iter().all(|l| l.facet_wrapped));
    }
}
