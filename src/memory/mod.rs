//! In-process implementations of the driver traits. They evaluate what the
//! compilers emit, so the whole read and write path runs without a server.

pub mod document;
pub mod relational;

pub use document::MemoryDocumentStore;
pub use relational::{ExecutedStatement, Fault, MemoryRelationalDriver, TableSpec};
