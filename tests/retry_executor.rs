use datagate::catalog::types::{ColumnType, Value};
use datagate::commit::executor::RecordingSleeper;
use datagate::error::TransientFault;
use datagate::memory::{Fault, TableSpec};
use datagate::query::plan::{Query, Statement, col, lit};
use datagate::{
    BulkWriteBatch, BulkWriteCoordinator, Collection, ConnectionRole, ConnectionRouter,
    DriverError, EntityDescriptor, GateConfig, GateError, GateErrorCode, MemoryRelationalDriver,
    RelationalBackend, RetryPolicy, SchemaCache, StatementExecutor,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn driver() -> Arc<MemoryRelationalDriver> {
    let driver = MemoryRelationalDriver::new("orders");
    driver.create_table(
        TableSpec::new("orders", "id")
            .with_column("reference", ColumnType::Text)
            .with_column("total", ColumnType::Float),
    );
    driver
        .seed(
            "orders",
            vec![
                json!({"id": 1, "reference": "R-1", "total": 12.0}),
                json!({"id": 2, "reference": "R-2", "total": 30.0}),
            ],
        )
        .expect("seed orders");
    Arc::new(driver)
}

fn recorded_backend(
    driver: &Arc<MemoryRelationalDriver>,
    config: GateConfig,
) -> (
    RelationalBackend<MemoryRelationalDriver, RecordingSleeper>,
    RecordingSleeper,
) {
    let sleeper = RecordingSleeper::new();
    let executor = StatementExecutor::with_sleeper(
        driver.clone(),
        RetryPolicy::from_config(&config),
        sleeper.clone(),
    );
    let backend = RelationalBackend::with_parts(
        EntityDescriptor::new("order", "orders"),
        config.clone(),
        executor,
        Arc::new(ConnectionRouter::new(config.replica_reads_enabled)),
        Arc::new(SchemaCache::new(config.schema_cache_capacity, true)),
    );
    (backend, sleeper)
}

#[tokio::test]
async fn deadlocks_back_off_exponentially_then_succeed() {
    let driver = driver();
    let config = GateConfig::default().with_deadlock_backoff_unit(Duration::from_secs(1));
    let (backend, sleeper) = recorded_backend(&driver, config);
    driver.inject(Fault::times(DriverError::deadlock(), 2).on_writes());

    let created = BulkWriteCoordinator::new(&backend)
        .bulk_create(BulkWriteBatch::from_json(vec![json!({"id": 3, "reference": "R-3", "total": 8.0})]).expect("batch"))
        .await
        .expect("third attempt succeeds");

    assert_eq!(created.len(), 1);
    assert_eq!(
        sleeper.recorded(),
        vec![Duration::from_secs(2), Duration::from_secs(4)]
    );
    assert_eq!(driver.executions_of("insert"), 3);
    assert_eq!(driver.rows("orders").len(), 3);
    assert_eq!(driver.reconnect_count(), 0);
}

#[tokio::test]
async fn deadlocks_past_the_bound_are_transient_faults() {
    let driver = driver();
    let config = GateConfig::default().with_retry_bounds(3, 2);
    let (backend, sleeper) = recorded_backend(&driver, config);
    driver.inject(Fault::always(DriverError::lock_wait_timeout()).on_writes());

    let err = BulkWriteCoordinator::new(&backend)
        .bulk_create(BulkWriteBatch::from_json(vec![json!({"id": 3, "reference": "R-3"})]).expect("batch"))
        .await
        .expect_err("deadlock never clears");

    assert!(matches!(
        err,
        GateError::TransientStorageFault {
            fault: TransientFault::Deadlock,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(sleeper.recorded().len(), 2);
    assert_eq!(driver.rows("orders").len(), 2);
}

#[tokio::test]
async fn lost_connections_reconnect_a_bounded_number_of_times() {
    let driver = driver();
    let config = GateConfig::default().with_retry_bounds(3, 5);
    let (backend, sleeper) = recorded_backend(&driver, config);
    driver.inject(Fault::always(DriverError::server_gone_away()));

    let err = Collection::new(Arc::new(backend))
        .load()
        .await
        .map(|_| ())
        .expect_err("server stays away");

    assert_eq!(err.code(), GateErrorCode::TransientStorageFault);
    assert!(matches!(
        err,
        GateError::TransientStorageFault {
            fault: TransientFault::ConnectionLost,
            attempts: 4,
            ..
        }
    ));
    assert_eq!(driver.reconnect_count(), 3);
    assert_eq!(driver.executions_of("select"), 4);
    assert!(sleeper.recorded().is_empty());
}

#[tokio::test]
async fn a_single_lost_connection_is_recovered() {
    let driver = driver();
    let (backend, _) = recorded_backend(&driver, GateConfig::default());
    driver.inject(Fault::once(DriverError::lost_connection()));

    let mut collection = Collection::new(Arc::new(backend));
    assert_eq!(collection.get_size().await.expect("recovered"), 2);
    assert_eq!(driver.reconnect_count(), 1);
}

#[tokio::test]
async fn unclassified_errors_fail_without_retrying() {
    let driver = driver();
    let executor = StatementExecutor::new(driver.clone(), RetryPolicy::default());
    driver.inject(Fault::once(
        DriverError::new("You have an error in your SQL syntax").with_code(1064),
    ));
    let select = Statement::Select(Query::select_all().from("orders"));

    let err = executor
        .execute(ConnectionRole::Replica, &select)
        .await
        .expect_err("syntax errors are fatal");
    assert_eq!(err.code_str(), "fatal_storage_fault");
    assert_eq!(driver.executed().len(), 1);

    let rows = executor
        .execute(
            ConnectionRole::Replica,
            &Statement::Select(
                Query::select_all()
                    .from("orders")
                    .where_(col("total").gt(lit(20.0))),
            ),
        )
        .await
        .expect("fault consumed")
        .into_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("reference"), Some(&Value::from("R-2")));
}

#[tokio::test]
async fn writes_and_their_confirmation_use_the_primary() {
    let driver = driver();
    let backend = RelationalBackend::new(
        EntityDescriptor::new("order", "orders").with_unique_field("reference"),
        GateConfig::default(),
        driver.clone(),
    );
    BulkWriteCoordinator::new(&backend)
        .bulk_create(BulkWriteBatch::from_json(vec![json!({"id": 3, "reference": "R-3"})]).expect("batch"))
        .await
        .expect("create");

    let roles: Vec<(&str, ConnectionRole)> = driver
        .executed()
        .iter()
        .map(|e| (e.kind, e.role))
        .collect();
    assert_eq!(
        roles,
        vec![
            ("select", ConnectionRole::Replica),
            ("count", ConnectionRole::Replica),
            ("insert", ConnectionRole::Primary),
            ("select", ConnectionRole::Primary),
            ("count", ConnectionRole::Primary),
        ]
    );
    assert!(!backend.router().is_forced());
}
