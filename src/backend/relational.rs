use crate::backend::{ItemOutcome, Payload, SearchBackend, WriteBackend, WriteReport};
use crate::catalog::cache::SchemaCache;
use crate::catalog::schema::EntityDescriptor;
use crate::catalog::types::{ColumnTypes, Row, Value};
use crate::commit::executor::{RetryPolicy, Sleeper, StatementExecutor, TokioSleeper};
use crate::commit::router::ConnectionRouter;
use crate::config::GateConfig;
use crate::criteria::{AggregationKind, AggregationSpec, MetricKind, SearchCriteria};
use crate::driver::{RelationalDriver, StatementOutput};
use crate::error::GateError;
use crate::filter::FilterGroup;
use crate::query::plan::Statement;
use crate::query::planner::{
    DOC_COUNT_COLUMN, KEY_COLUMN, METRIC_COLUMN, RelationalCompiler, RelationalSearch,
};
use crate::results::{AggregationValue, Aggregations, Bucket, SearchOutcome, StatsValue};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Reads and writes one entity through a relational driver. Every statement
/// goes through the retry executor on the connection the router picks.
pub struct RelationalBackend<D, S = TokioSleeper> {
    entity: EntityDescriptor,
    config: GateConfig,
    executor: StatementExecutor<D, S>,
    router: Arc<ConnectionRouter>,
    schema_cache: Arc<SchemaCache>,
}

impl<D: RelationalDriver> RelationalBackend<D, TokioSleeper> {
    pub fn new(entity: EntityDescriptor, config: GateConfig, driver: Arc<D>) -> Self {
        let executor = StatementExecutor::new(driver, RetryPolicy::from_config(&config));
        let router = Arc::new(ConnectionRouter::new(config.replica_reads_enabled));
        let schema_cache = Arc::new(SchemaCache::new(
            config.schema_cache_capacity,
            config.schema_cache_enabled,
        ));
        Self::with_parts(entity, config, executor, router, schema_cache)
    }
}

impl<D: RelationalDriver, S: Sleeper> RelationalBackend<D, S> {
    /// Shares a router and schema cache between backends of one connection.
    pub fn with_parts(
        entity: EntityDescriptor,
        config: GateConfig,
        executor: StatementExecutor<D, S>,
        router: Arc<ConnectionRouter>,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        Self {
            entity,
            config,
            executor,
            router,
            schema_cache,
        }
    }

    pub fn router(&self) -> &ConnectionRouter {
        &self.router
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub fn executor(&self) -> &StatementExecutor<D, S> {
        &self.executor
    }

    /// Column types the driver reports, overlaid with the ones the entity
    /// declares.
    pub async fn column_types(&self) -> Result<ColumnTypes, GateError> {
        let driver = self.executor.driver();
        let table = self.entity.storage_name.as_str();
        let loaded = self
            .schema_cache
            .get_or_load(driver.connection_name(), table, || async move {
                driver
                    .describe(table)
                    .await
                    .map_err(|err| GateError::FatalStorageFault {
                        message: err.message,
                    })
            })
            .await?;
        let mut merged = (*loaded).clone();
        for column in self.entity.column_types.columns() {
            if let Some(declared) = self.entity.column_types.get(column) {
                merged.insert(column, declared);
            }
        }
        Ok(merged)
    }

    pub async fn compile(&self, criteria: &SearchCriteria) -> Result<RelationalSearch, GateError> {
        let columns = self.column_types().await?;
        RelationalCompiler::new(&self.entity, &columns, &self.config).compile(criteria)
    }

    async fn run(&self, statement: Statement) -> Result<StatementOutput, GateError> {
        let role = self.router.route(statement.is_write());
        self.executor.execute(role, &statement).await
    }

    /// The id when every payload carries one, otherwise the first declared
    /// unique field they all carry, so rows the engine numbered can be found
    /// again.
    fn confirmation_key(&self, payloads: &[Payload]) -> &str {
        let carried = |field: &str| {
            payloads
                .iter()
                .all(|p| p.get(field).is_some_and(|v| !v.is_null()))
        };
        let id_field = self.entity.id_field.as_str();
        if carried(id_field) {
            return id_field;
        }
        self.entity
            .unique_fields
            .iter()
            .map(String::as_str)
            .find(|field| carried(*field))
            .unwrap_or(id_field)
    }

    /// Re-reads attempted keys on the primary and reports which exist, along
    /// with the id each stored row has. Payloads without a key were part of
    /// an atomic statement that succeeded.
    async fn confirm(&self, key_field: &str, payloads: &[Payload]) -> Result<WriteReport, GateError> {
        let keys: Vec<Value> = payloads
            .iter()
            .filter_map(|p| p.get(key_field).filter(|v| !v.is_null()))
            .map(Value::from_json)
            .collect();
        let id_field = self.entity.id_field.as_str();
        let stored: BTreeMap<String, Option<Value>> = self
            .router
            .with_write_connection(|| self.find_by(key_field, keys))
            .await?
            .iter()
            .filter_map(|row| {
                let key = Value::from_json(row.get(key_field)?).to_key_string();
                let id = row
                    .get(id_field)
                    .filter(|v| !v.is_null())
                    .map(Value::from_json);
                Some((key, id))
            })
            .collect();
        let items = payloads
            .iter()
            .map(|p| match p.get(key_field).filter(|v| !v.is_null()) {
                Some(key) => match stored.get(&Value::from_json(key).to_key_string()) {
                    Some(id) => ItemOutcome {
                        persisted: true,
                        id: id.clone(),
                    },
                    None => ItemOutcome {
                        persisted: false,
                        id: None,
                    },
                },
                None => ItemOutcome {
                    persisted: true,
                    id: None,
                },
            })
            .collect();
        Ok(WriteReport { items })
    }
}

impl<D: RelationalDriver, S: Sleeper> SearchBackend for RelationalBackend<D, S> {
    fn entity(&self) -> &EntityDescriptor {
        &self.entity
    }

    fn config(&self) -> &GateConfig {
        &self.config
    }

    async fn search(&self, criteria: &SearchCriteria) -> Result<SearchOutcome, GateError> {
        let compiled = self.compile(criteria).await?;
        let rows = self.run(Statement::Select(compiled.select)).await?.into_rows();
        let total = self.run(Statement::Count(compiled.count)).await?.count();
        let mut aggregations = Aggregations::new();
        for aggregation in compiled.aggregations {
            let rows = self
                .run(Statement::Select(aggregation.query))
                .await?
                .into_rows();
            aggregations.insert(
                aggregation.spec.name.clone(),
                aggregation_value(&aggregation.spec, &rows),
            );
        }
        debug!(
            entity = %self.entity.name,
            rows = rows.len(),
            total,
            "relational search finished"
        );
        Ok(SearchOutcome {
            rows: rows.iter().map(Row::to_json_map).collect(),
            total,
            aggregations,
        })
    }
}

impl<D: RelationalDriver, S: Sleeper> WriteBackend for RelationalBackend<D, S> {
    async fn insert(&self, payloads: Vec<Payload>) -> Result<WriteReport, GateError> {
        let columns = self.column_types().await?;
        let statement = RelationalCompiler::new(&self.entity, &columns, &self.config)
            .insert(&payloads, Vec::new())?;
        self.run(Statement::Insert(statement)).await?;
        let key_field = self.confirmation_key(&payloads);
        self.confirm(key_field, &payloads).await
    }

    async fn upsert(
        &self,
        payloads: Vec<Payload>,
        key_field: &str,
        update_fields: Vec<String>,
    ) -> Result<WriteReport, GateError> {
        let columns = self.column_types().await?;
        let statement = RelationalCompiler::new(&self.entity, &columns, &self.config)
            .insert(&payloads, update_fields)?;
        self.run(Statement::Insert(statement)).await?;
        self.confirm(key_field, &payloads).await
    }

    async fn update(&self, changes: Vec<(Value, Payload)>) -> Result<WriteReport, GateError> {
        let columns = self.column_types().await?;
        let mut statements = Vec::with_capacity(changes.len());
        {
            let compiler = RelationalCompiler::new(&self.entity, &columns, &self.config);
            for (id, delta) in &changes {
                statements.push(compiler.update(id, delta)?);
            }
        }
        for statement in statements {
            self.run(Statement::Update(statement)).await?;
        }
        let id_field = self.entity.id_field.as_str();
        let touched: Vec<Payload> = changes
            .iter()
            .map(|(id, _)| {
                let mut key = Map::new();
                key.insert(id_field.to_string(), id.to_json());
                key
            })
            .collect();
        self.confirm(id_field, &touched).await
    }

    async fn delete(&self, groups: &[FilterGroup]) -> Result<u64, GateError> {
        let columns = self.column_types().await?;
        let statement =
            RelationalCompiler::new(&self.entity, &columns, &self.config).delete(groups)?;
        Ok(self.run(Statement::Delete(statement)).await?.count())
    }
}

fn aggregation_value(spec: &AggregationSpec, rows: &[Row]) -> AggregationValue {
    match &spec.kind {
        AggregationKind::Metric(MetricKind::Stats) => {
            let row = rows.first();
            let number = |name: &str| row.and_then(|r| r.get(name)).and_then(as_f64);
            AggregationValue::Stats(StatsValue {
                count: row.map(|r| as_count(r.get("count"))).unwrap_or(0),
                min: number("min"),
                max: number("max"),
                avg: number("avg"),
                sum: number("sum").unwrap_or(0.0),
            })
        }
        AggregationKind::Metric(_) => AggregationValue::Metric(
            rows.first()
                .and_then(|r| r.get(METRIC_COLUMN))
                .and_then(as_f64),
        ),
        AggregationKind::Composite => AggregationValue::Composite {
            buckets: rows
                .iter()
                .map(|row| {
                    let key: Map<String, JsonValue> = row
                        .values
                        .iter()
                        .filter(|(name, _)| name.as_str() != DOC_COUNT_COLUMN)
                        .map(|(name, v)| (name.clone(), v.to_json()))
                        .collect();
                    Bucket::new(JsonValue::Object(key), as_count(row.get(DOC_COUNT_COLUMN)))
                })
                .collect(),
            after_key: None,
        },
        AggregationKind::Terms | AggregationKind::Filter(_) | AggregationKind::Histogram => {
            AggregationValue::Buckets(
                rows.iter()
                    .map(|row| {
                        Bucket::new(
                            row.get(KEY_COLUMN).map(Value::to_json).unwrap_or(JsonValue::Null),
                            as_count(row.get(DOC_COUNT_COLUMN)),
                        )
                    })
                    .collect(),
            )
        }
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Text(t) => t.trim().parse().ok(),
        other => other.as_f64(),
    }
}

fn as_count(value: Option<&Value>) -> u64 {
    value.and_then(as_f64).map(|n| n.max(0.0) as u64).unwrap_or(0)
}
