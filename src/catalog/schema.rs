use crate::catalog::types::{ColumnType, ColumnTypes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Describes one persisted entity: where it lives and which of its fields
/// carry write-time rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    /// Relational table or document index.
    pub storage_name: String,
    pub id_field: String,
    /// Declared column types. The relational backend merges these over what
    /// the schema cache loads from the driver.
    #[serde(default)]
    pub column_types: ColumnTypes,
    /// JSON columns (or full dotted paths) that may be filtered by sub-path.
    #[serde(default)]
    pub json_filter_allow_list: BTreeSet<String>,
    #[serde(default)]
    pub unique_fields: Vec<String>,
    #[serde(default)]
    pub uniqueness_scope_fields: Vec<String>,
    #[serde(default)]
    pub locked_attributes_field: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Nested-object paths in the document mapping.
    #[serde(default)]
    pub nested_paths: Vec<String>,
    /// Nested paths whose matching sub-objects are returned as inner hits.
    #[serde(default)]
    pub inner_hits_paths: BTreeSet<String>,
    /// Virtual facet name to the sibling fields that share it.
    #[serde(default)]
    pub virtual_facets: BTreeMap<String, Vec<String>>,
}

impl EntityDescriptor {
    pub fn new(name: impl Into<String>, storage_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_name: storage_name.into(),
            id_field: "id".to_string(),
            column_types: ColumnTypes::new(),
            json_filter_allow_list: BTreeSet::new(),
            unique_fields: Vec::new(),
            uniqueness_scope_fields: Vec::new(),
            locked_attributes_field: None,
            required_fields: Vec::new(),
            nested_paths: Vec::new(),
            inner_hits_paths: BTreeSet::new(),
            virtual_facets: BTreeMap::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_column(mut self, column: impl Into<String>, column_type: ColumnType) -> Self {
        self.column_types.insert(column, column_type);
        self
    }

    pub fn with_column_types(mut self, column_types: ColumnTypes) -> Self {
        self.column_types = column_types;
        self
    }

    pub fn allow_json_filter(mut self, column_or_path: impl Into<String>) -> Self {
        self.json_filter_allow_list.insert(column_or_path.into());
        self
    }

    pub fn with_unique_field(mut self, field: impl Into<String>) -> Self {
        self.unique_fields.push(field.into());
        self
    }

    pub fn with_uniqueness_scope(mut self, field: impl Into<String>) -> Self {
        self.uniqueness_scope_fields.push(field.into());
        self
    }

    pub fn with_locked_attributes_field(mut self, field: impl Into<String>) -> Self {
        self.locked_attributes_field = Some(field.into());
        self
    }

    pub fn with_required_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn with_nested_path(mut self, path: impl Into<String>, inner_hits: bool) -> Self {
        let path = path.into();
        if inner_hits {
            self.inner_hits_paths.insert(path.clone());
        }
        self.nested_paths.push(path);
        self
    }

    pub fn with_virtual_facet<I, S>(mut self, facet: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.virtual_facets
            .insert(facet.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// The configured nested path a field lives under. A field equal to the
    /// path itself is a root field.
    pub fn nested_path_of(&self, field: &str) -> Option<&str> {
        self.nested_paths
            .iter()
            .filter(|path| {
                field.len() > path.len()
                    && field.starts_with(path.as_str())
                    && field.as_bytes()[path.len()] == b'.'
            })
            .max_by_key(|path| path.len())
            .map(String::as_str)
    }

    /// The field itself plus every sibling declared under a shared virtual facet.
    pub fn facet_siblings(&self, field: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::from([field.to_string()]);
        for members in self.virtual_facets.values() {
            if members.iter().any(|m| m == field) {
                out.extend(members.iter().cloned());
            }
        }
        out
    }

    pub fn json_filter_allowed(&self, column: &str, full_path: &str) -> bool {
        self.json_filter_allow_list.contains(column)
            || self.json_filter_allow_list.contains(full_path)
    }
}

#[cfg(test)]
mod tests {
    use super::EntityDescriptor;

    #[test]
    fn nested_path_requires_dot_boundary() {
        let entity = EntityDescriptor::new("product", "products")
            .with_nested_path("variants", false)
            .with_nested_path("variants.stock", false);
        assert_eq!(entity.nested_path_of("variants.sku"), Some("variants"));
        assert_eq!(
            entity.nested_path_of("variants.stock.qty"),
            Some("variants.stock")
        );
        assert_eq!(entity.nested_path_of("variants"), None);
        assert_eq!(entity.nested_path_of("variantsx.sku"), None);
    }

    #[test]
    fn facet_siblings_are_transitive_through_shared_facet() {
        let entity = EntityDescriptor::new("product", "products")
            .with_virtual_facet("color", ["color_family", "color_shade"]);
        let siblings = entity.facet_siblings("color_shade");
        assert!(siblings.contains("color_family"));
        assert!(siblings.contains("color_shade"));
        assert_eq!(entity.facet_siblings("size").len(), 1);
    }
}
