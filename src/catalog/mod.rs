pub mod cache;
pub mod schema;
pub mod types;

pub use cache::SchemaCache;
pub use schema::EntityDescriptor;
pub use types::{ColumnType, ColumnTypes, Row, Value};
