//! In-process document store. Parses the search DSL back into a query tree
//! and evaluates it, aggregations included, over documents held in memory.

use crate::catalog::types::Value;
use crate::criteria::MatchType;
use crate::document::dsl::{BoolQuery, DocQuery, RangeBounds};
use crate::driver::{BulkItemStatus, BulkOperation, BulkResponse, DocumentStore, StoreError};
use crate::query::operators::{compare_values, regex_match};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as JsonValue, json};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

const DEFAULT_SIZE: u64 = 10;

#[derive(Debug, Clone)]
struct StoredDocument {
    id: String,
    source: JsonValue,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    documents: Vec<StoredDocument>,
    next_id: u64,
}

impl MemoryIndex {
    fn position(&self, id: &str) -> Option<usize> {
        self.documents.iter().position(|d| d.id == id)
    }

    fn generate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let candidate = format!("auto-{}", self.next_id);
            if self.position(&candidate).is_none() {
                return candidate;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    indices: RwLock<BTreeMap<String, MemoryIndex>>,
    rejected_ids: Mutex<BTreeSet<String>>,
    search_faults: Mutex<VecDeque<StoreError>>,
    searches: Mutex<Vec<JsonValue>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_index(&self, index: &str) {
        self.indices.write().entry(index.to_string()).or_default();
    }

    /// Stores documents under the value of `id_field`, generating an id when
    /// a document has none.
    pub fn seed(&self, index: &str, id_field: &str, documents: Vec<JsonValue>) {
        let mut indices = self.indices.write();
        let target = indices.entry(index.to_string()).or_default();
        for source in documents {
            let id = match source.get(id_field).filter(|v| !v.is_null()) {
                Some(v) => Value::from_json(v).to_key_string(),
                None => target.generate_id(),
            };
            match target.position(&id) {
                Some(pos) => target.documents[pos].source = source,
                None => target.documents.push(StoredDocument { id, source }),
            }
        }
    }

    pub fn get(&self, index: &str, id: &str) -> Option<JsonValue> {
        let indices = self.indices.read();
        let target = indices.get(index)?;
        target
            .position(id)
            .map(|pos| target.documents[pos].source.clone())
    }

    /// `(id, source)` pairs in insertion order.
    pub fn documents(&self, index: &str) -> Vec<(String, JsonValue)> {
        self.indices
            .read()
            .get(index)
            .map(|t| {
                t.documents
                    .iter()
                    .map(|d| (d.id.clone(), d.source.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bulk items addressing `id` fail with a mapping error and store nothing.
    pub fn reject_writes_for(&self, id: impl Into<String>) {
        self.rejected_ids.lock().insert(id.into());
    }

    pub fn fail_next_search(&self, error: StoreError) {
        self.search_faults.lock().push_back(error);
    }

    /// Bodies of every search received, oldest first.
    pub fn searches(&self) -> Vec<JsonValue> {
        self.searches.lock().clone()
    }

    fn run_search(&self, index: &str, body: &JsonValue) -> Result<JsonValue, StoreError> {
        let indices = self.indices.read();
        let target = indices
            .get(index)
            .ok_or_else(|| StoreError::new(format!("no such index [{index}]")).with_status(404))?;
        let query = parse_clause(body.get("query"))?.unwrap_or(DocQuery::MatchAll);
        let post_filter = parse_clause(body.get("post_filter"))?;
        let sorts = parse_sorts(body.get("sort"))?;

        let matched: Vec<&StoredDocument> = target
            .documents
            .iter()
            .filter(|d| matches(&query, &d.source))
            .collect();

        let aggregations = match body.get("aggs").and_then(JsonValue::as_object) {
            Some(aggs) => {
                let roots: Vec<&JsonValue> = matched.iter().map(|d| &d.source).collect();
                let scoped: Vec<Scoped> = roots
                    .iter()
                    .enumerate()
                    .map(|(root, doc)| Scoped {
                        root,
                        doc: (*doc).clone(),
                    })
                    .collect();
                Some(aggregate_all(&roots, aggs, &scoped)?)
            }
            None => None,
        };

        let mut hits: Vec<(&StoredDocument, Vec<Option<Value>>)> = matched
            .into_iter()
            .filter(|d| post_filter.as_ref().is_none_or(|q| matches(q, &d.source)))
            .map(|d| {
                let keys = sorts.iter().map(|s| s.value_of(&d.source)).collect();
                (d, keys)
            })
            .collect();
        hits.sort_by(|(_, a), (_, b)| compare_keys(&sorts, a, b));
        if let Some(after) = body.get("search_after").and_then(JsonValue::as_array) {
            let after: Vec<Option<Value>> = after
                .iter()
                .map(|v| (!v.is_null()).then(|| Value::from_json(v)))
                .collect();
            hits.retain(|(_, keys)| compare_keys(&sorts, keys, &after) == Ordering::Greater);
        }
        let total = hits.len() as u64;

        let collapse_field = body
            .pointer("/collapse/field")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let collapse_inner = body
            .pointer("/collapse/inner_hits/name")
            .and_then(JsonValue::as_str)
            .map(str::to_string);
        let mut groups: BTreeMap<String, Vec<&StoredDocument>> = BTreeMap::new();
        if let Some(field) = &collapse_field {
            let mut kept = Vec::with_capacity(hits.len());
            for (doc, keys) in hits {
                let key = collapse_key(&doc.source, field);
                let members = groups.entry(key).or_default();
                if members.is_empty() {
                    kept.push((doc, keys));
                }
                members.push(doc);
            }
            hits = kept;
        }

        let from = body.get("from").and_then(JsonValue::as_u64).unwrap_or(0);
        let size = body
            .get("size")
            .and_then(JsonValue::as_u64)
            .unwrap_or(DEFAULT_SIZE);
        let source_filter = body.get("_source");
        let rendered: Vec<JsonValue> = hits
            .into_iter()
            .skip(usize::try_from(from).unwrap_or(usize::MAX))
            .take(usize::try_from(size).unwrap_or(usize::MAX))
            .map(|(doc, keys)| {
                let mut hit = Map::new();
                hit.insert("_index".into(), json!(index));
                hit.insert("_id".into(), json!(doc.id));
                hit.insert("_score".into(), JsonValue::Null);
                hit.insert("_source".into(), filter_source(&doc.source, source_filter));
                if !sorts.is_empty() {
                    hit.insert(
                        "sort".into(),
                        JsonValue::Array(
                            keys.iter()
                                .map(|k| k.as_ref().map(Value::to_json).unwrap_or(JsonValue::Null))
                                .collect(),
                        ),
                    );
                }
                let mut inner = Map::new();
                nested_inner_hits(&query, &doc.source, &mut inner);
                if let (Some(field), Some(name)) = (&collapse_field, &collapse_inner) {
                    let members = groups
                        .get(&collapse_key(&doc.source, field))
                        .map(|m| {
                            m.iter()
                                .map(|d| json!({ "_id": d.id, "_source": d.source }))
                                .collect()
                        })
                        .unwrap_or_default();
                    inner.insert(name.clone(), hits_body(members));
                }
                if !inner.is_empty() {
                    hit.insert("inner_hits".into(), JsonValue::Object(inner));
                }
                JsonValue::Object(hit)
            })
            .collect();

        let mut response = json!({
            "took": 0,
            "timed_out": false,
            "hits": {
                "total": { "value": total, "relation": "eq" },
                "max_score": null,
                "hits": rendered
            }
        });
        if let (Some(aggs), Some(obj)) = (aggregations, response.as_object_mut()) {
            obj.insert("aggregations".into(), JsonValue::Object(aggs));
        }
        Ok(response)
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn search(&self, index: &str, body: &JsonValue) -> Result<JsonValue, StoreError> {
        self.searches.lock().push(body.clone());
        if let Some(error) = self.search_faults.lock().pop_front() {
            return Err(error);
        }
        let response = self.run_search(index, body)?;
        debug!(
            index,
            total = ?response.pointer("/hits/total/value").and_then(JsonValue::as_u64),
            "memory search"
        );
        Ok(response)
    }

    async fn bulk(
        &self,
        index: &str,
        operations: Vec<BulkOperation>,
    ) -> Result<BulkResponse, StoreError> {
        let rejected = self.rejected_ids.lock().clone();
        let mut indices = self.indices.write();
        let target = indices.entry(index.to_string()).or_default();
        let items = operations
            .into_iter()
            .map(|operation| apply(target, operation, &rejected))
            .collect();
        Ok(BulkResponse { items })
    }

    async fn delete_by_query(&self, index: &str, body: &JsonValue) -> Result<u64, StoreError> {
        let query = parse_clause(body.get("query"))?
            .ok_or_else(|| StoreError::new("delete_by_query needs a query").with_status(400))?;
        let mut indices = self.indices.write();
        let target = indices
            .get_mut(index)
            .ok_or_else(|| StoreError::new(format!("no such index [{index}]")).with_status(404))?;
        let before = target.documents.len();
        target.documents.retain(|d| !matches(&query, &d.source));
        Ok((before - target.documents.len()) as u64)
    }
}

fn apply(target: &mut MemoryIndex, operation: BulkOperation, rejected: &BTreeSet<String>) -> BulkItemStatus {
    let (id, document, mode) = match operation {
        BulkOperation::Create { id, document } => {
            let id = id.unwrap_or_else(|| target.generate_id());
            (id, document, WriteMode::CreateOnly)
        }
        BulkOperation::Index { id, document } => {
            let id = id.unwrap_or_else(|| target.generate_id());
            (id, document, WriteMode::Replace)
        }
        BulkOperation::Upsert { id, document } => (id, document, WriteMode::MergeOrCreate),
        BulkOperation::Update { id, document } => (id, document, WriteMode::MergeExisting),
    };
    if rejected.contains(&id) {
        return BulkItemStatus {
            id: Some(id),
            status: 400,
            error: Some("mapper_parsing_exception".into()),
        };
    }
    let status = match (target.position(&id), mode) {
        (Some(_), WriteMode::CreateOnly) => {
            return BulkItemStatus {
                id: Some(id),
                status: 409,
                error: Some("version_conflict_engine_exception".into()),
            };
        }
        (Some(pos), WriteMode::Replace) => {
            target.documents[pos].source = JsonValue::Object(document);
            200
        }
        (Some(pos), _) => {
            if let Some(stored) = target.documents[pos].source.as_object_mut() {
                stored.extend(document);
            }
            200
        }
        (None, WriteMode::MergeExisting) => {
            return BulkItemStatus {
                id: Some(id),
                status: 404,
                error: Some("document_missing_exception".into()),
            };
        }
        (None, _) => {
            target.documents.push(StoredDocument {
                id: id.clone(),
                source: JsonValue::Object(document),
            });
            201
        }
    };
    BulkItemStatus {
        id: Some(id),
        status,
        error: None,
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    CreateOnly,
    Replace,
    MergeOrCreate,
    MergeExisting,
}

fn bad_request(message: impl Into<String>) -> StoreError {
    StoreError::new(message).with_status(400)
}

fn parse_clause(clause: Option<&JsonValue>) -> Result<Option<DocQuery>, StoreError> {
    clause
        .map(|q| DocQuery::from_json(q).map_err(|e| bad_request(e.to_string())))
        .transpose()
}

/// Every value at a dotted path, with arrays flattened at each level.
fn values_at<'a>(doc: &'a JsonValue, path: &str) -> Vec<&'a JsonValue> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for node in current {
            collect_child(node, segment, &mut next);
        }
        current = next;
    }
    let mut out = Vec::with_capacity(current.len());
    for node in current {
        match node {
            JsonValue::Array(items) => out.extend(items.iter().filter(|v| !v.is_null())),
            JsonValue::Null => {}
            other => out.push(other),
        }
    }
    out
}

fn collect_child<'a>(node: &'a JsonValue, segment: &str, out: &mut Vec<&'a JsonValue>) {
    match node {
        JsonValue::Object(map) => {
            if let Some(child) = map.get(segment) {
                out.push(child);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                collect_child(item, segment, out);
            }
        }
        _ => {}
    }
}

/// Wraps one nested object back under its path so dotted field names
/// resolve against it.
fn scoped(path: &str, element: &JsonValue) -> JsonValue {
    path.rsplit('.')
        .fold(element.clone(), |inner, segment| json!({ segment: inner }))
}

fn nested_elements<'a>(doc: &'a JsonValue, path: &str) -> Vec<&'a JsonValue> {
    values_at(doc, path)
        .into_iter()
        .filter(|v| v.is_object())
        .collect()
}

fn text_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => Value::from_json(other).to_key_string(),
    }
}

fn same_json(left: &JsonValue, right: &JsonValue) -> bool {
    Value::from_json(left) == Value::from_json(right)
}

fn matches(query: &DocQuery, doc: &JsonValue) -> bool {
    match query {
        DocQuery::MatchAll => true,
        DocQuery::Term { field, value } => values_at(doc, field).iter().any(|v| same_json(v, value)),
        DocQuery::Terms { field, values } => values_at(doc, field)
            .iter()
            .any(|v| values.iter().any(|w| same_json(v, w))),
        DocQuery::Range { field, bounds } => values_at(doc, field)
            .iter()
            .any(|v| within(&Value::from_json(v), bounds)),
        DocQuery::Exists { field } => !values_at(doc, field).is_empty(),
        DocQuery::Wildcard {
            field,
            pattern,
            case_insensitive,
        } => {
            let regex = anchor(&wildcard_regex(pattern), *case_insensitive);
            values_at(doc, field)
                .iter()
                .any(|v| regex_match(&text_of(v), &regex) == Some(true))
        }
        DocQuery::Regexp {
            field,
            pattern,
            case_insensitive,
        } => {
            let regex = anchor(pattern, *case_insensitive);
            values_at(doc, field)
                .iter()
                .any(|v| regex_match(&text_of(v), &regex) == Some(true))
        }
        DocQuery::MultiMatch {
            query,
            fields,
            match_type,
            parameters,
        } => multi_match(doc, query, fields, *match_type, parameters),
        DocQuery::Nested { path, query, .. } => nested_elements(doc, path)
            .iter()
            .any(|element| matches(query, &scoped(path, element))),
        DocQuery::Bool(b) => bool_matches(b, doc),
    }
}

fn bool_matches(b: &BoolQuery, doc: &JsonValue) -> bool {
    if !b.must.iter().chain(&b.filter).all(|q| matches(q, doc)) {
        return false;
    }
    if b.must_not.iter().any(|q| matches(q, doc)) {
        return false;
    }
    let required = match b.minimum_should_match {
        Some(n) => n as usize,
        None if b.must.is_empty() && b.filter.is_empty() && !b.should.is_empty() => 1,
        None => 0,
    };
    required == 0 || b.should.iter().filter(|q| matches(q, doc)).count() >= required
}

fn within(value: &Value, bounds: &RangeBounds) -> bool {
    let check = |bound: &Option<JsonValue>, accept: fn(Ordering) -> bool| match bound {
        None => true,
        Some(b) => compare_values(value, &Value::from_json(b)).is_some_and(accept),
    };
    check(&bounds.gt, Ordering::is_gt)
        && check(&bounds.gte, Ordering::is_ge)
        && check(&bounds.lt, Ordering::is_lt)
        && check(&bounds.lte, Ordering::is_le)
}

fn wildcard_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out
}

fn anchor(pattern: &str, case_insensitive: bool) -> String {
    let flags = if case_insensitive { "" } else { "(?-i)" };
    format!("{flags}^(?:{pattern})$")
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn multi_match(
    doc: &JsonValue,
    query: &str,
    fields: &[String],
    match_type: MatchType,
    parameters: &Map<String, JsonValue>,
) -> bool {
    let mut texts: Vec<String> = Vec::new();
    if fields.is_empty() {
        if let Some(map) = doc.as_object() {
            texts.extend(map.values().filter(|v| v.is_string()).map(text_of));
        }
    }
    for field in fields {
        let name = field.split('^').next().unwrap_or(field);
        texts.extend(values_at(doc, name).into_iter().map(text_of));
    }
    let needle = query.to_lowercase();
    let wanted = tokens(query);
    let require_all = parameters
        .get("operator")
        .and_then(JsonValue::as_str)
        .is_some_and(|op| op.eq_ignore_ascii_case("and"));
    texts.iter().any(|text| match match_type {
        MatchType::Phrase | MatchType::PhrasePrefix => text.to_lowercase().contains(&needle),
        MatchType::BoolPrefix => {
            let have = tokens(text);
            let (last, rest) = match wanted.split_last() {
                Some(split) => split,
                None => return false,
            };
            let prefix_hit = have.iter().any(|t| t.starts_with(last.as_str()));
            let rest_hits = rest.iter().filter(|w| have.contains(w)).count();
            if require_all {
                prefix_hit && rest_hits == rest.len()
            } else {
                prefix_hit || rest_hits > 0
            }
        }
        _ => {
            let have = tokens(text);
            let hits = wanted.iter().filter(|w| have.contains(w)).count();
            if require_all {
                !wanted.is_empty() && hits == wanted.len()
            } else {
                hits > 0
            }
        }
    })
}

/// Nested sub-objects each `inner_hits`-carrying nested clause matched.
fn nested_inner_hits(query: &DocQuery, doc: &JsonValue, out: &mut Map<String, JsonValue>) {
    match query {
        DocQuery::Nested {
            path,
            query: inner,
            inner_hits: Some(spec),
        } => {
            let name = spec
                .get("name")
                .and_then(JsonValue::as_str)
                .unwrap_or(path)
                .to_string();
            let hits: Vec<JsonValue> = nested_elements(doc, path)
                .into_iter()
                .filter(|element| matches(inner, &scoped(path, element)))
                .map(|element| json!({ "_source": element }))
                .collect();
            out.insert(name, hits_body(hits));
        }
        DocQuery::Bool(b) => {
            for clause in b.must.iter().chain(&b.filter).chain(&b.should) {
                nested_inner_hits(clause, doc, out);
            }
        }
        _ => {}
    }
}

fn hits_body(hits: Vec<JsonValue>) -> JsonValue {
    json!({
        "hits": {
            "total": { "value": hits.len(), "relation": "eq" },
            "hits": hits
        }
    })
}

fn collapse_key(doc: &JsonValue, field: &str) -> String {
    values_at(doc, field)
        .first()
        .map(|v| Value::from_json(v).to_key_string())
        .unwrap_or_default()
}

fn filter_source(source: &JsonValue, filter: Option<&JsonValue>) -> JsonValue {
    let Some(filter) = filter else {
        return source.clone();
    };
    let list = |key: &str| -> Vec<String> {
        filter
            .get(key)
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };
    let includes = list("includes");
    let excludes = list("excludes");
    let Some(map) = source.as_object() else {
        return source.clone();
    };
    let mut out: Map<String, JsonValue> = if includes.is_empty() {
        map.clone()
    } else {
        let mut picked = Map::new();
        for path in &includes {
            copy_path(map, &mut picked, path);
        }
        picked
    };
    for path in &excludes {
        remove_path(&mut out, path);
    }
    JsonValue::Object(out)
}

fn copy_path(from: &Map<String, JsonValue>, to: &mut Map<String, JsonValue>, path: &str) {
    match path.split_once('.') {
        None => {
            if let Some(v) = from.get(path) {
                to.insert(path.to_string(), v.clone());
            }
        }
        Some((head, rest)) => {
            if let Some(JsonValue::Object(child)) = from.get(head) {
                let entry = to
                    .entry(head.to_string())
                    .or_insert_with(|| JsonValue::Object(Map::new()));
                if let Some(target) = entry.as_object_mut() {
                    copy_path(child, target, rest);
                }
            }
        }
    }
}

fn remove_path(map: &mut Map<String, JsonValue>, path: &str) {
    match path.split_once('.') {
        None => {
            map.remove(path);
        }
        Some((head, rest)) => {
            if let Some(JsonValue::Object(child)) = map.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Min,
    Max,
    Sum,
    Avg,
    Median,
}

#[derive(Debug, Clone)]
struct SortKey {
    field: String,
    descending: bool,
    mode: Mode,
    nested: Option<(String, Option<DocQuery>)>,
}

impl SortKey {
    fn value_of(&self, doc: &JsonValue) -> Option<Value> {
        let values: Vec<Value> = match &self.nested {
            Some((path, filter)) => nested_elements(doc, path)
                .into_iter()
                .map(|element| scoped(path, element))
                .filter(|s| filter.as_ref().is_none_or(|q| matches(q, s)))
                .flat_map(|s| {
                    values_at(&s, &self.field)
                        .into_iter()
                        .map(Value::from_json)
                        .collect::<Vec<_>>()
                })
                .collect(),
            None => values_at(doc, &self.field)
                .into_iter()
                .map(Value::from_json)
                .collect(),
        };
        reduce(values, self.mode)
    }
}

fn reduce(mut values: Vec<Value>, mode: Mode) -> Option<Value> {
    if values.is_empty() {
        return None;
    }
    match mode {
        Mode::Min => values.into_iter().min(),
        Mode::Max => values.into_iter().max(),
        Mode::Sum | Mode::Avg => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                return None;
            }
            let sum: f64 = numbers.iter().sum();
            Some(Value::Float(if mode == Mode::Sum {
                sum
            } else {
                sum / numbers.len() as f64
            }))
        }
        Mode::Median => {
            values.sort();
            values.get(values.len() / 2).cloned()
        }
    }
}

fn parse_sorts(sort: Option<&JsonValue>) -> Result<Vec<SortKey>, StoreError> {
    let Some(entries) = sort.and_then(JsonValue::as_array) else {
        return Ok(Vec::new());
    };
    let mut keys = Vec::with_capacity(entries.len());
    for entry in entries {
        let (field, spec) = match entry {
            JsonValue::String(field) => (field.clone(), JsonValue::Null),
            JsonValue::Object(map) if map.len() == 1 => match map.iter().next() {
                Some((field, spec)) => (field.clone(), spec.clone()),
                None => continue,
            },
            other => return Err(bad_request(format!("malformed sort entry {other}"))),
        };
        let order = match &spec {
            JsonValue::String(order) => order.as_str(),
            other => other.get("order").and_then(JsonValue::as_str).unwrap_or("asc"),
        };
        let descending = order.eq_ignore_ascii_case("desc");
        let mode = match spec.get("mode").and_then(JsonValue::as_str) {
            Some("min") => Mode::Min,
            Some("max") => Mode::Max,
            Some("sum") => Mode::Sum,
            Some("avg") => Mode::Avg,
            Some("median") => Mode::Median,
            Some(other) => return Err(bad_request(format!("unknown sort mode [{other}]"))),
            None if descending => Mode::Max,
            None => Mode::Min,
        };
        let nested = match spec.get("nested") {
            Some(n) => {
                let path = n
                    .get("path")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| bad_request("nested sort needs a path"))?;
                Some((path.to_string(), parse_clause(n.get("filter"))?))
            }
            None => None,
        };
        keys.push(SortKey {
            field,
            descending,
            mode,
            nested,
        });
    }
    Ok(keys)
}

/// Missing values sort last in either direction.
fn compare_keys(sorts: &[SortKey], a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
    for (idx, sort) in sorts.iter().enumerate() {
        let ordering = match (a.get(idx).cloned().flatten(), b.get(idx).cloned().flatten()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(x), Some(y)) => {
                let natural = compare_values(&x, &y).unwrap_or_else(|| x.cmp(&y));
                if sort.descending {
                    natural.reverse()
                } else {
                    natural
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// A document as an aggregation sees it: the nested object in scope, plus
/// the position of the top-level document it came from.
#[derive(Debug, Clone)]
struct Scoped {
    root: usize,
    doc: JsonValue,
}

fn aggregate_all(
    roots: &[&JsonValue],
    aggs: &Map<String, JsonValue>,
    docs: &[Scoped],
) -> Result<Map<String, JsonValue>, StoreError> {
    let mut out = Map::new();
    for (name, node) in aggs {
        out.insert(name.clone(), aggregate_node(roots, name, node, docs)?);
    }
    Ok(out)
}

fn with_sub_aggs(
    roots: &[&JsonValue],
    node: &JsonValue,
    docs: &[Scoped],
    mut body: Map<String, JsonValue>,
) -> Result<JsonValue, StoreError> {
    if let Some(sub) = node.get("aggs").and_then(JsonValue::as_object) {
        body.extend(aggregate_all(roots, sub, docs)?);
    }
    Ok(JsonValue::Object(body))
}

fn field_of<'a>(body: &'a JsonValue, name: &str) -> Result<&'a str, StoreError> {
    body.get("field")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| bad_request(format!("aggregation [{name}] needs a field")))
}

fn numbers_in(docs: &[Scoped], field: &str) -> Vec<f64> {
    docs.iter()
        .flat_map(|d| values_at(&d.doc, field))
        .filter_map(|v| match v {
            JsonValue::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        })
        .collect()
}

fn aggregate_node(
    roots: &[&JsonValue],
    name: &str,
    node: &JsonValue,
    docs: &[Scoped],
) -> Result<JsonValue, StoreError> {
    let (kind, body) = node
        .as_object()
        .and_then(|map| map.iter().find(|(k, _)| k.as_str() != "aggs" && k.as_str() != "meta"))
        .ok_or_else(|| bad_request(format!("aggregation [{name}] has no type")))?;
    match kind.as_str() {
        "terms" => {
            let field = field_of(body, name)?;
            let size = body.get("size").and_then(JsonValue::as_u64).unwrap_or(DEFAULT_SIZE);
            let mut buckets: BTreeMap<Value, (JsonValue, Vec<Scoped>)> = BTreeMap::new();
            for doc in docs {
                let distinct: BTreeMap<Value, &JsonValue> = values_at(&doc.doc, field)
                    .into_iter()
                    .map(|v| (Value::from_json(v), v))
                    .collect();
                for (key, raw) in distinct {
                    buckets
                        .entry(key)
                        .or_insert_with(|| (raw.clone(), Vec::new()))
                        .1
                        .push(doc.clone());
                }
            }
            let mut ranked: Vec<(JsonValue, Vec<Scoped>)> = buckets.into_values().collect();
            ranked.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
            let total: usize = ranked.iter().map(|(_, members)| members.len()).sum();
            let shown: Vec<(JsonValue, Vec<Scoped>)> = ranked
                .into_iter()
                .take(usize::try_from(size).unwrap_or(usize::MAX))
                .collect();
            let shown_count: usize = shown.iter().map(|(_, members)| members.len()).sum();
            let rendered = shown
                .into_iter()
                .map(|(key, members)| bucket(roots, node, key, &members))
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = Map::new();
            out.insert("doc_count_error_upper_bound".into(), json!(0));
            out.insert("sum_other_doc_count".into(), json!(total - shown_count));
            out.insert("buckets".into(), JsonValue::Array(rendered));
            Ok(JsonValue::Object(out))
        }
        "histogram" => {
            let field = field_of(body, name)?;
            let interval = body
                .get("interval")
                .and_then(JsonValue::as_f64)
                .filter(|i| *i > 0.0)
                .ok_or_else(|| bad_request(format!("histogram [{name}] needs a positive interval")))?;
            let min_doc_count = body
                .get("min_doc_count")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            let mut steps: BTreeMap<i64, Vec<Scoped>> = BTreeMap::new();
            for doc in docs {
                let seen: BTreeSet<i64> = numbers_in(std::slice::from_ref(doc), field)
                    .into_iter()
                    .map(|n| (n / interval).floor() as i64)
                    .collect();
                for step in seen {
                    steps.entry(step).or_default().push(doc.clone());
                }
            }
            if min_doc_count == 0 {
                if let (Some(&lo), Some(&hi)) = (steps.keys().next(), steps.keys().next_back()) {
                    for step in lo..=hi {
                        steps.entry(step).or_default();
                    }
                }
            }
            let rendered = steps
                .into_iter()
                .filter(|(_, members)| members.len() as u64 >= min_doc_count)
                .map(|(step, members)| bucket(roots, node, json!(step as f64 * interval), &members))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "buckets": rendered }))
        }
        "avg" | "min" | "max" | "sum" => {
            let numbers = numbers_in(docs, field_of(body, name)?);
            let value = match kind.as_str() {
                "sum" => Some(numbers.iter().sum::<f64>()),
                _ if numbers.is_empty() => None,
                "avg" => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
                "min" => numbers.iter().copied().reduce(f64::min),
                _ => numbers.iter().copied().reduce(f64::max),
            };
            Ok(json!({ "value": value }))
        }
        "value_count" => {
            let field = field_of(body, name)?;
            let count: usize = docs.iter().map(|d| values_at(&d.doc, field).len()).sum();
            Ok(json!({ "value": count }))
        }
        "stats" => {
            let numbers = numbers_in(docs, field_of(body, name)?);
            let sum: f64 = numbers.iter().sum();
            let (min, max, avg) = if numbers.is_empty() {
                (None, None, None)
            } else {
                (
                    numbers.iter().copied().reduce(f64::min),
                    numbers.iter().copied().reduce(f64::max),
                    Some(sum / numbers.len() as f64),
                )
            };
            Ok(json!({ "count": numbers.len(), "min": min, "max": max, "avg": avg, "sum": sum }))
        }
        "cardinality" => {
            let field = field_of(body, name)?;
            let distinct: BTreeSet<Value> = docs
                .iter()
                .flat_map(|d| values_at(&d.doc, field))
                .map(Value::from_json)
                .collect();
            Ok(json!({ "value": distinct.len() }))
        }
        "filter" => {
            let query = DocQuery::from_json(body).map_err(|e| bad_request(e.to_string()))?;
            let kept: Vec<Scoped> = docs.iter().filter(|d| matches(&query, &d.doc)).cloned().collect();
            let mut out = Map::new();
            out.insert("doc_count".into(), json!(kept.len()));
            with_sub_aggs(roots, node, &kept, out)
        }
        "nested" => {
            let path = body
                .get("path")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| bad_request(format!("nested [{name}] needs a path")))?;
            let inner: Vec<Scoped> = docs
                .iter()
                .flat_map(|d| {
                    nested_elements(&d.doc, path)
                        .into_iter()
                        .map(|element| Scoped {
                            root: d.root,
                            doc: scoped(path, element),
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
            let mut out = Map::new();
            out.insert("doc_count".into(), json!(inner.len()));
            with_sub_aggs(roots, node, &inner, out)
        }
        "reverse_nested" => {
            let distinct: BTreeSet<usize> = docs.iter().map(|d| d.root).collect();
            let outer: Vec<Scoped> = distinct
                .into_iter()
                .filter_map(|root| {
                    roots.get(root).map(|doc| Scoped {
                        root,
                        doc: (*doc).clone(),
                    })
                })
                .collect();
            let mut out = Map::new();
            out.insert("doc_count".into(), json!(outer.len()));
            with_sub_aggs(roots, node, &outer, out)
        }
        "composite" => composite(roots, name, node, body, docs),
        other => Err(bad_request(format!("unknown aggregation type [{other}] for [{name}]"))),
    }
}

fn bucket(
    roots: &[&JsonValue],
    node: &JsonValue,
    key: JsonValue,
    members: &[Scoped],
) -> Result<JsonValue, StoreError> {
    let mut out = Map::new();
    out.insert("key".into(), key);
    out.insert("doc_count".into(), json!(members.len()));
    with_sub_aggs(roots, node, members, out)
}

fn composite(
    roots: &[&JsonValue],
    name: &str,
    node: &JsonValue,
    body: &JsonValue,
    docs: &[Scoped],
) -> Result<JsonValue, StoreError> {
    let size = body.get("size").and_then(JsonValue::as_u64).unwrap_or(DEFAULT_SIZE);
    let mut sources: Vec<(String, String)> = Vec::new();
    for source in body
        .get("sources")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| bad_request(format!("composite [{name}] needs sources")))?
    {
        let (alias, spec) = source
            .as_object()
            .and_then(|m| m.iter().next())
            .ok_or_else(|| bad_request(format!("composite [{name}] has an empty source")))?;
        let field = spec
            .pointer("/terms/field")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| bad_request(format!("composite source [{alias}] needs terms.field")))?;
        sources.push((alias.clone(), field.to_string()));
    }

    let mut buckets: BTreeMap<Vec<Value>, (Map<String, JsonValue>, Vec<Scoped>)> = BTreeMap::new();
    for doc in docs {
        // Every combination of the document's values across sources.
        let mut combos: Vec<(Vec<Value>, Map<String, JsonValue>)> = vec![(Vec::new(), Map::new())];
        for (alias, field) in &sources {
            let values: BTreeMap<Value, &JsonValue> = values_at(&doc.doc, field)
                .into_iter()
                .map(|v| (Value::from_json(v), v))
                .collect();
            let mut next = Vec::with_capacity(combos.len() * values.len());
            for (key, shown) in &combos {
                for (value, raw) in &values {
                    let mut key = key.clone();
                    key.push(value.clone());
                    let mut shown = shown.clone();
                    shown.insert(alias.clone(), (*raw).clone());
                    next.push((key, shown));
                }
            }
            combos = next;
        }
        for (key, shown) in combos {
            buckets
                .entry(key)
                .or_insert_with(|| (shown, Vec::new()))
                .1
                .push(doc.clone());
        }
    }

    let after: Option<Vec<Value>> = body.get("after").map(|after| {
        sources
            .iter()
            .map(|(alias, _)| after.get(alias).map(Value::from_json).unwrap_or(Value::Null))
            .collect()
    });
    let page: Vec<(Map<String, JsonValue>, Vec<Scoped>)> = buckets
        .into_iter()
        .filter(|(key, _)| after.as_ref().is_none_or(|a| key > a))
        .take(usize::try_from(size).unwrap_or(usize::MAX))
        .map(|(_, bucket)| bucket)
        .collect();
    let after_key = page.last().map(|(key, _)| JsonValue::Object(key.clone()));
    let rendered = page
        .into_iter()
        .map(|(key, members)| bucket(roots, node, JsonValue::Object(key), &members))
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Map::new();
    out.insert("buckets".into(), JsonValue::Array(rendered));
    if let Some(after_key) = after_key {
        out.insert("after_key".into(), after_key);
    }
    Ok(JsonValue::Object(out))
}

#[cfg(test)]
mod tests {
    use super::MemoryDocumentStore;
    use crate::driver::{BulkOperation, DocumentStore};
    use serde_json::{Map, json};

    fn store() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        store.seed(
            "products",
            "id",
            vec![
                json!({"id": 1, "brand": "acme", "price": 12, "variants": [
                    {"size": "m", "color": "red", "price": 12},
                    {"size": "l", "color": "blue", "price": 15}
                ]}),
                json!({"id": 2, "brand": "zeta", "price": 31, "variants": [
                    {"size": "s", "color": "red", "price": 31}
                ]}),
                json!({"id": 3, "brand": "acme", "price": 47, "variants": []}),
            ],
        );
        store
    }

    #[tokio::test]
    async fn nested_queries_match_within_one_object() {
        let store = store();
        let body = json!({
            "query": {"nested": {"path": "variants", "query": {"bool": {"filter": [
                {"term": {"variants.size": {"value": "m"}}},
                {"term": {"variants.color": {"value": "blue"}}}
            ]}}}},
            "size": 10
        });
        let response = store.search("products", &body).await.expect("search");
        assert_eq!(response["hits"]["total"]["value"], json!(0));

        let body = json!({
            "query": {"nested": {"path": "variants", "inner_hits": {"name": "variants"},
                "query": {"term": {"variants.color": {"value": "red"}}}}},
            "sort": [{"price": {"order": "desc"}}],
            "size": 10
        });
        let response = store.search("products", &body).await.expect("search");
        let hits = response["hits"]["hits"].as_array().expect("hits");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["_id"], json!("2"));
        assert_eq!(
            hits[1]["inner_hits"]["variants"]["hits"]["hits"][0]["_source"]["size"],
            json!("m")
        );
    }

    #[tokio::test]
    async fn histogram_fills_empty_steps() {
        let store = store();
        let body = json!({
            "query": {"match_all": {}},
            "size": 0,
            "aggs": {"price": {"histogram": {"field": "price", "interval": 10.0, "min_doc_count": 0}}}
        });
        let response = store.search("products", &body).await.expect("search");
        let keys: Vec<f64> = response["aggregations"]["price"]["buckets"]
            .as_array()
            .expect("buckets")
            .iter()
            .filter_map(|b| b["key"].as_f64())
            .collect();
        assert_eq!(keys, vec![10.0, 20.0, 30.0, 40.0]);
    }

    #[tokio::test]
    async fn reverse_nested_counts_parents() {
        let store = store();
        let body = json!({
            "size": 0,
            "aggs": {"variants": {"nested": {"path": "variants"}, "aggs": {
                "color": {"terms": {"field": "variants.color", "size": 10}, "aggs": {
                    "parents": {"reverse_nested": {}}
                }}
            }}}
        });
        let response = store.search("products", &body).await.expect("search");
        let nested = &response["aggregations"]["variants"];
        assert_eq!(nested["doc_count"], json!(3));
        assert_eq!(nested["color"]["buckets"][0]["key"], json!("red"));
        assert_eq!(nested["color"]["buckets"][0]["parents"]["doc_count"], json!(2));
    }

    #[tokio::test]
    async fn bulk_statuses_follow_request_order() {
        let store = store();
        store.reject_writes_for("9");
        let mut patch = Map::new();
        patch.insert("price".into(), json!(13));
        let response = store
            .bulk(
                "products",
                vec![
                    BulkOperation::Update {
                        id: "1".into(),
                        document: patch.clone(),
                    },
                    BulkOperation::Update {
                        id: "8".into(),
                        document: patch.clone(),
                    },
                    BulkOperation::Upsert {
                        id: "9".into(),
                        document: patch.clone(),
                    },
                    BulkOperation::Index {
                        id: None,
                        document: patch,
                    },
                ],
            )
            .await
            .expect("bulk");
        let statuses: Vec<u16> = response.items.iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![200, 404, 400, 201]);
        assert_eq!(store.get("products", "1").expect("doc")["brand"], json!("acme"));
        assert_eq!(store.get("products", "1").expect("doc")["price"], json!(13));
        assert_eq!(store.documents("products").len(), 4);
    }

    #[tokio::test]
    async fn create_conflicts_with_an_existing_id() {
        let store = store();
        let mut document = Map::new();
        document.insert("brand".into(), json!("intruder"));
        let response = store
            .bulk(
                "products",
                vec![
                    BulkOperation::Create {
                        id: Some("1".into()),
                        document: document.clone(),
                    },
                    BulkOperation::Create {
                        id: Some("7".into()),
                        document,
                    },
                ],
            )
            .await
            .expect("bulk");
        let statuses: Vec<u16> = response.items.iter().map(|i| i.status).collect();
        assert_eq!(statuses, vec![409, 201]);
        assert_eq!(store.get("products", "1").expect("doc")["brand"], json!("acme"));
        assert_eq!(store.get("products", "7").expect("doc")["brand"], json!("intruder"));
    }

    #[tokio::test]
    async fn delete_by_query_removes_matches() {
        let store = store();
        let deleted = store
            .delete_by_query("products", &json!({"query": {"term": {"brand": {"value": "acme"}}}}))
            .await
            .expect("delete");
        assert_eq!(deleted, 2);
        assert_eq!(store.documents("products").len(), 1);
    }
}
