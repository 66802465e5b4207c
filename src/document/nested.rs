//! Root vs nested-object partitioning of clauses.

use crate::catalog::schema::EntityDescriptor;
use crate::document::dsl::{BoolQuery, DocQuery};
use serde_json::json;
use std::collections::BTreeMap;

/// One compiled clause and whether it restricts (`filter`) or excludes
/// (`must_not`).
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub query: DocQuery,
    pub negated: bool,
}

impl Clause {
    pub fn positive(query: DocQuery) -> Self {
        Self {
            query,
            negated: false,
        }
    }

    pub fn negative(query: DocQuery) -> Self {
        Self {
            query,
            negated: true,
        }
    }

    /// Standalone form usable as a `should` alternative.
    pub fn into_query(self) -> DocQuery {
        if self.negated {
            self.query.negate()
        } else {
            self.query
        }
    }
}

/// Clauses split by the nested path they live under; `None` is the root.
#[derive(Debug, Default)]
pub struct NestedPartition {
    pub root: Vec<Clause>,
    pub nested: BTreeMap<String, Vec<Clause>>,
}

impl NestedPartition {
    pub fn push(&mut self, path: Option<&str>, clause: Clause) {
        match path {
            Some(path) => self.nested.entry(path.to_string()).or_default().push(clause),
            None => self.root.push(clause),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.nested.is_empty()
    }
}

/// Wraps clauses that must hold on one nested object into a `nested`
/// container, adding inner hits when the entity asks for them on `path`.
pub fn nested_container(
    entity: &EntityDescriptor,
    path: &str,
    query: DocQuery,
    with_inner_hits: bool,
) -> DocQuery {
    let inner_hits = (with_inner_hits && entity.inner_hits_paths.contains(path))
        .then(|| json!({ "name": path }));
    DocQuery::Nested {
        path: path.to_string(),
        query: Box::new(query),
        inner_hits,
    }
}

/// AND of clauses: positives into `filter`, negatives into `must_not`.
pub fn conjunction(clauses: Vec<Clause>) -> DocQuery {
    let mut bool_query = BoolQuery::default();
    for clause in clauses {
        if clause.negated {
            bool_query.must_not.push(clause.query);
        } else {
            bool_query.filter.push(clause.query);
        }
    }
    bool_query.into_query()
}

/// OR of clauses with at least one required.
pub fn disjunction(clauses: Vec<Clause>) -> DocQuery {
    let mut alternatives: Vec<DocQuery> = clauses.into_iter().map(Clause::into_query).collect();
    if alternatives.len() == 1 {
        if let Some(only) = alternatives.pop() {
            return only;
        }
    }
    DocQuery::Bool(BoolQuery::any_of(alternatives))
}

#[cfg(test)]
mod tests {
    use super::{Clause, NestedPartition, conjunction, disjunction, nested_container};
    use crate::catalog::schema::EntityDescriptor;
    use crate::document::dsl::{BoolQuery, DocQuery};
    use serde_json::json;

    #[test]
    fn partition_keeps_paths_apart() {
        let mut partition = NestedPartition::default();
        partition.push(None, Clause::positive(DocQuery::exists("sku")));
        partition.push(Some("variants"), Clause::positive(DocQuery::exists("variants.size")));
        partition.push(Some("variants"), Clause::negative(DocQuery::exists("variants.color")));
        assert_eq!(partition.root.len(), 1);
        assert_eq!(partition.nested["variants"].len(), 2);
    }

    #[test]
    fn conjunction_routes_negatives() {
        let query = conjunction(vec![
            Clause::positive(DocQuery::term("a", json!(1))),
            Clause::negative(DocQuery::term("b", json!(2))),
        ]);
        assert_eq!(
            query,
            DocQuery::Bool(BoolQuery {
                filter: vec![DocQuery::term("a", json!(1))],
                must_not: vec![DocQuery::term("b", json!(2))],
                ..BoolQuery::default()
            })
        );
    }

    #[test]
    fn disjunction_requires_one() {
        let query = disjunction(vec![
            Clause::positive(DocQuery::term("a", json!(1))),
            Clause::positive(DocQuery::term("a", json!(2))),
        ]);
        let DocQuery::Bool(b) = query else {
            panic!("expected bool");
        };
        assert_eq!(b.minimum_should_match, Some(1));
        assert_eq!(b.should.len(), 2);
    }

    #[test]
    fn inner_hits_only_for_configured_paths() {
        let entity = EntityDescriptor::new("product", "products")
            .with_nested_path("variants", true)
            .with_nested_path("reviews", false);
        let with = nested_container(&entity, "variants", DocQuery::MatchAll, true);
        let without = nested_container(&entity, "reviews", DocQuery::MatchAll, true);
        assert!(matches!(with, DocQuery::Nested { inner_hits: Some(_), .. }));
        assert!(matches!(without, DocQuery::Nested { inner_hits: None, .. }));
    }
}
