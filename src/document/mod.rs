pub mod aggregation;
pub mod compiler;
pub mod dsl;
pub mod nested;
pub mod response;

pub use aggregation::{AggregationLayout, AggregationShape, COLLAPSE_CARDINALITY, TOTAL_DISTINCT};
pub use compiler::{DocumentCompiler, DocumentSearch};
pub use dsl::{BoolQuery, DocQuery, SearchRequest};
pub use response::ResponseProcessor;
