pub mod error;
pub mod operators;
pub mod plan;
pub mod planner;
pub mod sql;

pub use planner::{RelationalAggregation, RelationalCompiler, RelationalSearch};
pub use sql::{SqlStatement, render};
