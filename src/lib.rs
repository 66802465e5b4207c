//! Storage-agnostic data access: one criteria model compiled for a relational
//! engine and for a document search engine, plus a bulk write path with
//! uniqueness checks, locked-field preservation and retrying execution.

pub mod backend;
pub mod catalog;
pub mod collection;
pub mod commit;
pub mod config;
pub mod criteria;
pub mod document;
pub mod driver;
pub mod error;
pub mod filter;
pub mod memory;
pub mod query;
pub mod record;
pub mod results;

pub use backend::{
    DocumentBackend, ItemOutcome, Payload, RelationalBackend, SearchBackend, WriteBackend,
    WriteReport,
};
pub use catalog::{ColumnType, ColumnTypes, EntityDescriptor, Row, SchemaCache, Value};
pub use collection::Collection;
pub use commit::{
    BulkWriteBatch, BulkWriteCoordinator, ConnectionRouter, RetryPolicy, StatementExecutor,
    UniquenessConflictReport, WriteIntent,
};
pub use config::GateConfig;
pub use criteria::{
    AggregationSpec, CollapseSpec, FullTextClause, MatchType, MetricKind, PaginationSpec,
    SearchCriteria, SortDirection, SortMode, SortSpec,
};
pub use driver::{
    BulkOperation, BulkResponse, ConnectionRole, DocumentStore, DriverError, RelationalDriver,
    StatementOutput, StoreError,
};
pub use error::{GateError, GateErrorCode};
pub use filter::{
    FieldFilter, FilterCondition, FilterGroup, FilterGroupBuilder, FilterOperator, FilterValue,
    GroupLogic,
};
pub use memory::{MemoryDocumentStore, MemoryRelationalDriver};
pub use record::{Record, RecordSet};
pub use results::{AggregationValue, Aggregations, Bucket, SearchOutcome, StatsValue};
