use criterion::{Criterion, black_box, criterion_group, criterion_main};
use datagate::catalog::types::{ColumnType, ColumnTypes};
use datagate::document::compiler::DocumentCompiler;
use datagate::memory::TableSpec;
use datagate::query::{RelationalCompiler, render};
use datagate::query::plan::Statement;
use datagate::{
    AggregationSpec, Collection, EntityDescriptor, FieldFilter, FilterCondition, FilterGroup,
    GateConfig, MemoryRelationalDriver, MetricKind, PaginationSpec, RelationalBackend,
    SearchCriteria, SortSpec, Value,
};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

const SEEDED_ROWS: i64 = 5_000;

fn entity() -> EntityDescriptor {
    EntityDescriptor::new("product", "products")
        .with_nested_path("variants", true)
        .with_virtual_facet("look", ["color", "family"])
}

fn columns() -> ColumnTypes {
    ColumnTypes::new()
        .with("id", ColumnType::Integer)
        .with("brand", ColumnType::Text)
        .with("color", ColumnType::Text)
        .with("family", ColumnType::Text)
        .with("price", ColumnType::Float)
}

fn criteria() -> SearchCriteria {
    let ids: Vec<Value> = (1..=200).map(Value::Integer).collect();
    SearchCriteria::new()
        .filter(FilterGroup::and(vec![
            FilterCondition::between("price", 5.0, 500.0),
            FilterCondition::in_list("id", ids),
        ]))
        .filter(FilterGroup::or(vec![
            FilterCondition::eq("brand", "acme"),
            FilterCondition::eq("brand", "zeta"),
        ]))
        .post_filter(FilterGroup::and(vec![FilterCondition::eq("color", "red")]))
        .sort(SortSpec::desc("price"))
        .paginate(PaginationSpec::new(3, 50).expect("pagination"))
        .aggregate(AggregationSpec::terms("brand"))
        .aggregate(AggregationSpec::terms("color"))
        .aggregate(AggregationSpec::histogram("price", Some(25.0)))
        .aggregate(AggregationSpec::metric("price", MetricKind::Stats))
}

fn seeded_backend() -> Arc<RelationalBackend<MemoryRelationalDriver>> {
    let driver = MemoryRelationalDriver::new("bench");
    driver.create_table(
        TableSpec::new("products", "id")
            .with_column("brand", ColumnType::Text)
            .with_column("color", ColumnType::Text)
            .with_column("family", ColumnType::Text)
            .with_column("price", ColumnType::Float),
    );
    let brands = ["acme", "zeta", "omni", "nova"];
    let colors = ["red", "blue", "green"];
    let rows = (1..=SEEDED_ROWS)
        .map(|id| {
            json!({
                "id": id,
                "brand": brands[(id % 4) as usize],
                "color": colors[(id % 3) as usize],
                "family": format!("family-{}", id % 40),
                "price": (id % 700) as f64 + 0.5,
            })
        })
        .collect();
    driver.seed("products", rows).expect("seed");
    Arc::new(RelationalBackend::new(
        EntityDescriptor::new("product", "products"),
        GateConfig::default(),
        Arc::new(driver),
    ))
}

fn bench_compilers(c: &mut Criterion) {
    let entity = entity();
    let columns = columns();
    let config = GateConfig::default();
    let criteria = criteria();

    c.bench_function("relational_compile_and_render", |b| {
        b.iter(|| {
            let compiled = RelationalCompiler::new(&entity, &columns, &config)
                .compile(black_box(&criteria))
                .expect("compile");
            render(&Statement::Select(compiled.select)).expect("render")
        })
    });

    c.bench_function("document_compile_to_json", |b| {
        let compiler = DocumentCompiler::new(&entity, &config);
        b.iter(|| {
            compiler
                .compile(black_box(&criteria))
                .expect("compile")
                .request
                .to_json()
        })
    });
}

fn bench_memory_search(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let backend = seeded_backend();

    c.bench_function("memory_relational_faceted_page", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut collection = Collection::new(backend.clone());
                collection
                    .add_field_filter("price", FieldFilter::range(10.0, 400.0))
                    .expect("filter");
                collection.add_post_filter(FilterGroup::and(vec![FilterCondition::eq(
                    "brand", "acme",
                )]));
                collection.add_aggregation(AggregationSpec::terms("brand"));
                collection.add_sort(SortSpec::asc("price"));
                collection.set_page(2, 100).expect("page");
                black_box(collection.get_total_items_count().await.expect("load"))
            })
        })
    });
}

criterion_group!(benches, bench_compilers, bench_memory_search);
criterion_main!(benches);
