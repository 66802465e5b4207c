use datagate::catalog::types::{ColumnType, Row, Value};
use datagate::memory::TableSpec;
use datagate::{
    BulkWriteBatch, BulkWriteCoordinator, DocumentBackend, EntityDescriptor, GateConfig, GateError,
    GateErrorCode, MemoryDocumentStore, MemoryRelationalDriver, RelationalBackend,
};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;

fn products() -> EntityDescriptor {
    EntityDescriptor::new("product", "products")
        .with_unique_field("sku")
        .with_required_field("sku")
        .with_locked_attributes_field("locked_attributes")
}

fn driver() -> Arc<MemoryRelationalDriver> {
    let driver = MemoryRelationalDriver::new("catalog");
    driver.create_table(
        TableSpec::new("products", "id")
            .with_column("sku", ColumnType::Text)
            .with_column("name", ColumnType::Text)
            .with_column("price", ColumnType::Float)
            .with_column("locked_attributes", ColumnType::Json)
            .with_unique_key("uniq_sku", &["sku"]),
    );
    driver
        .seed(
            "products",
            vec![
                json!({"id": 1, "sku": "A", "name": "Oak", "price": 10.0, "locked_attributes": ["name"]}),
                json!({"id": 2, "sku": "B", "name": "Pine", "price": 20.0, "locked_attributes": []}),
                json!({"id": 3, "sku": "C", "name": "Elm", "price": 30.0, "locked_attributes": []}),
            ],
        )
        .expect("seed products");
    Arc::new(driver)
}

fn backend(driver: &Arc<MemoryRelationalDriver>) -> RelationalBackend<MemoryRelationalDriver> {
    RelationalBackend::new(products(), GateConfig::default(), driver.clone())
}

fn stored(driver: &MemoryRelationalDriver, sku: &str) -> Row {
    driver
        .rows("products")
        .into_iter()
        .find(|row| row.get("sku") == Some(&Value::from(sku)))
        .expect("stored row")
}

fn batch(items: Vec<JsonValue>) -> BulkWriteBatch {
    BulkWriteBatch::from_json(items).expect("batch")
}

#[tokio::test]
async fn upsert_patches_existing_inserts_new_and_keeps_locked_fields() {
    let driver = driver();
    let backend = backend(&driver);
    let writer = BulkWriteCoordinator::new(&backend);

    let written = writer
        .bulk_upsert(
            batch(vec![
                json!({"sku": "A", "name": "Walnut", "price": 11.0}),
                json!({"sku": "B", "name": "Birch", "price": 21.0}),
                json!({"sku": "C", "name": "Ash", "price": 31.0}),
                json!({"sku": "D", "name": "Teak", "price": 40.0}),
                json!({"sku": "E", "name": "Maple", "price": 50.0}),
            ])
            .keyed_by("sku"),
        )
        .await
        .expect("upsert");

    assert_eq!(written.len(), 5);
    assert_eq!(driver.rows("products").len(), 5);

    let a = stored(&driver, "A");
    assert_eq!(a.get("name"), Some(&Value::from("Oak")));
    assert_eq!(a.get("price"), Some(&Value::Float(11.0)));
    assert_eq!(stored(&driver, "B").get("name"), Some(&Value::from("Birch")));
    assert_eq!(stored(&driver, "C").get("price"), Some(&Value::Float(31.0)));

    let d = stored(&driver, "D");
    assert_eq!(d.get("id"), Some(&Value::Integer(4)));
    assert_eq!(d.get("locked_attributes"), Some(&Value::Null));
    assert_eq!(
        written.ids("id"),
        (1..=5).map(Value::Integer).collect::<Vec<_>>()
    );

    assert_eq!(driver.executions_of("insert"), 1);
}

#[tokio::test]
async fn upsert_can_override_locked_fields() {
    let driver = driver();
    let backend = backend(&driver);
    BulkWriteCoordinator::new(&backend)
        .bulk_upsert(
            batch(vec![json!({"sku": "A", "name": "Walnut"})])
                .keyed_by("sku")
                .override_locked(),
        )
        .await
        .expect("upsert");
    assert_eq!(stored(&driver, "A").get("name"), Some(&Value::from("Walnut")));
}

#[tokio::test]
async fn upsert_items_need_the_key() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_upsert(batch(vec![json!({"sku": "A"}), json!({"name": "x"})]).keyed_by("sku"))
        .await
        .expect_err("second item has no key");
    assert!(matches!(&err, GateError::InvalidBatchShape(msg) if msg == "item #1 has no 'sku'"));
    assert_eq!(driver.executions_of("insert"), 0);
}

#[tokio::test]
async fn create_reports_both_sides_of_an_in_batch_duplicate() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"id": 10, "sku": "X", "name": "One"}),
            json!({"id": 11, "sku": "X", "name": "Two"}),
            json!({"id": 12, "sku": "Y", "name": "Three"}),
        ]))
        .await
        .expect_err("duplicate sku");

    let GateError::UniquenessConflict(report) = err else {
        panic!("expected a uniqueness conflict, got {err:?}");
    };
    assert_eq!(report.len(), 2);
    assert!(report.contains("10"));
    assert!(report.contains("11"));
    assert!(!report.contains("12"));
    assert_eq!(
        report.fields_of("11").and_then(|f| f.get("sku")),
        Some(&json!("X"))
    );
    assert_eq!(driver.executions_of("insert"), 0);
}

#[tokio::test]
async fn create_detects_clashes_with_stored_rows() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![json!({"id": 20, "sku": "B", "name": "Copy"})]))
        .await
        .expect_err("sku B exists");
    assert_eq!(err.code(), GateErrorCode::UniquenessConflict);
    assert!(err.to_string().contains("20 (sku=\"B\")"));
}

#[tokio::test]
async fn direct_batches_skip_validation_and_surface_engine_duplicates() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![json!({"id": 20, "sku": "B", "name": "Copy"})]).direct())
        .await
        .expect_err("engine rejects the duplicate");
    assert_eq!(err.code(), GateErrorCode::DuplicateKey);
    assert!(err.to_string().contains("uniq_sku"));
    assert_eq!(driver.executions_of("insert"), 1);
}

#[tokio::test]
async fn create_checks_required_fields_first() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"id": 20, "sku": "Z"}),
            json!({"id": 21, "sku": null, "name": "Nameless"}),
        ]))
        .await
        .expect_err("sku is required");
    assert!(
        matches!(&err, GateError::InvalidBatchShape(msg) if msg == "item #1 is missing required fields: sku")
    );
    assert!(driver.executed().is_empty());
}

#[tokio::test]
async fn create_returns_the_persisted_records() {
    let driver = driver();
    let backend = backend(&driver);
    let created = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"id": 20, "sku": "Q", "name": "Cedar", "price": 9.5}),
            json!({"id": 21, "sku": "R", "name": "Fir", "price": 8.0}),
        ]))
        .await
        .expect("create");
    assert_eq!(
        created.ids("id"),
        vec![Value::Integer(20), Value::Integer(21)]
    );
    assert_eq!(stored(&driver, "R").get("name"), Some(&Value::from("Fir")));
}

#[tokio::test]
async fn create_without_ids_returns_the_assigned_ids() {
    let driver = driver();
    let backend = backend(&driver);
    let created = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"sku": "Q", "name": "Cedar"}),
            json!({"sku": "R", "name": "Fir"}),
        ]))
        .await
        .expect("create");

    assert_eq!(created.ids("id"), vec![Value::Integer(4), Value::Integer(5)]);
    assert_eq!(stored(&driver, "Q").get("id"), Some(&Value::Integer(4)));
    assert_eq!(stored(&driver, "R").get("id"), Some(&Value::Integer(5)));
}

#[tokio::test]
async fn empty_batches_are_rejected() {
    let driver = driver();
    let backend = backend(&driver);
    let writer = BulkWriteCoordinator::new(&backend);
    for err in [
        writer.bulk_create(BulkWriteBatch::default()).await.expect_err("create"),
        writer.bulk_update(BulkWriteBatch::default()).await.expect_err("update"),
        writer.bulk_upsert(BulkWriteBatch::default()).await.expect_err("upsert"),
    ] {
        assert_eq!(err.code(), GateErrorCode::EmptyBatch);
    }
}

#[tokio::test]
async fn update_writes_only_changed_fields_and_respects_locks() {
    let driver = driver();
    let backend = backend(&driver);
    let updated = BulkWriteCoordinator::new(&backend)
        .bulk_update(batch(vec![
            json!({"id": 1, "name": "Walnut", "price": 15.0}),
            json!({"id": 2, "name": "Pine"}),
            json!({"id": 3, "price": 35.0}),
        ]))
        .await
        .expect("update");

    assert_eq!(updated.ids("id"), vec![Value::Integer(1), Value::Integer(3)]);
    let a = stored(&driver, "A");
    assert_eq!(a.get("name"), Some(&Value::from("Oak")));
    assert_eq!(a.get("price"), Some(&Value::Float(15.0)));
    assert_eq!(stored(&driver, "C").get("price"), Some(&Value::Float(35.0)));
    assert_eq!(driver.executions_of("update"), 2);
}

#[tokio::test]
async fn update_without_changes_is_an_error() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_update(batch(vec![json!({"id": 2, "name": "Pine", "price": 20.0})]))
        .await
        .expect_err("nothing changed");
    assert_eq!(err.code(), GateErrorCode::NoChangesDetected);
    assert_eq!(driver.executions_of("update"), 0);
}

#[tokio::test]
async fn update_rejects_unknown_ids() {
    let driver = driver();
    let backend = backend(&driver);
    let err = BulkWriteCoordinator::new(&backend)
        .bulk_update(batch(vec![
            json!({"id": 2, "name": "Birch"}),
            json!({"id": 99, "name": "Ghost"}),
        ]))
        .await
        .expect_err("99 does not exist");
    assert!(matches!(&err, GateError::InvalidBatchShape(msg) if msg == "unknown 'product' ids: 99"));
}

fn document_backend(store: &Arc<MemoryDocumentStore>) -> DocumentBackend<MemoryDocumentStore> {
    store.create_index("products");
    store.seed(
        "products",
        "id",
        vec![
            json!({"id": "p1", "sku": "A", "name": "Oak", "price": 10.0, "locked_attributes": ["name"]}),
            json!({"id": "p2", "sku": "B", "name": "Pine", "price": 20.0}),
        ],
    );
    DocumentBackend::new(products(), GateConfig::default(), store.clone())
}

#[tokio::test]
async fn document_upsert_merges_into_stored_documents() {
    let store = Arc::new(MemoryDocumentStore::new());
    let backend = document_backend(&store);
    let written = BulkWriteCoordinator::new(&backend)
        .bulk_upsert(
            batch(vec![
                json!({"sku": "A", "name": "Walnut", "price": 12.0}),
                json!({"sku": "C", "name": "Teak", "price": 40.0}),
            ])
            .keyed_by("sku"),
        )
        .await
        .expect("upsert");

    assert_eq!(written.len(), 2);
    let a = store.get("products", "p1").expect("p1");
    assert_eq!(a["name"], json!("Oak"));
    assert_eq!(a["price"], json!(12.0));
    assert_eq!(a["locked_attributes"], json!(["name"]));
    assert_eq!(store.documents("products").len(), 3);

    let teak = written.iter().find(|r| r.get("sku") == Some(&json!("C"))).expect("new record");
    assert!(teak.get("id").is_some_and(JsonValue::is_string));
}

#[tokio::test]
async fn documents_the_store_rejects_are_dropped_not_raised() {
    let store = Arc::new(MemoryDocumentStore::new());
    let backend = document_backend(&store);
    store.reject_writes_for("p4");
    let created = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"id": "p3", "sku": "C", "name": "Teak"}),
            json!({"id": "p4", "sku": "D", "name": "Broken"}),
            json!({"id": "p5", "sku": "E", "name": "Maple"}),
        ]))
        .await
        .expect("create");

    assert_eq!(
        created.ids("id"),
        vec![Value::from("p3"), Value::from("p5")]
    );
    assert!(store.get("products", "p4").is_none());
}

#[tokio::test]
async fn document_create_never_replaces_a_stored_document() {
    let store = Arc::new(MemoryDocumentStore::new());
    let backend = document_backend(&store);
    let created = BulkWriteCoordinator::new(&backend)
        .bulk_create(batch(vec![
            json!({"id": "p1", "sku": "Z", "name": "Intruder"}),
            json!({"id": "p6", "sku": "F", "name": "Larch"}),
        ]))
        .await
        .expect("create");

    assert_eq!(created.ids("id"), vec![Value::from("p6")]);
    let p1 = store.get("products", "p1").expect("p1");
    assert_eq!(p1["sku"], json!("A"));
    assert_eq!(p1["name"], json!("Oak"));
    assert_eq!(store.documents("products").len(), 3);
}
