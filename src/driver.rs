//! Collaborator seams towards the two storage engines. Network clients live
//! outside this crate; the in-memory engines in [`crate::memory`] implement
//! the same traits.

use crate::catalog::types::{ColumnTypes, Row};
use crate::error::GateError;
use crate::query::plan::Statement;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Primary,
    Replica,
}

impl ConnectionRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionRole::Primary => "primary",
            ConnectionRole::Replica => "replica",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementOutput {
    Rows(Vec<Row>),
    Affected(u64),
    Count(u64),
}

impl StatementOutput {
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            StatementOutput::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            StatementOutput::Rows(rows) => rows.len() as u64,
            StatementOutput::Affected(n) | StatementOutput::Count(n) => *n,
        }
    }
}

/// Failure reported by a relational driver, carrying the server error number
/// and SQLSTATE when the server supplied them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    pub code: Option<u32>,
    pub sql_state: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            sql_state: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_sql_state(mut self, state: impl Into<String>) -> Self {
        self.sql_state = Some(state.into());
        self
    }

    pub fn duplicate_entry(value: &str, key: &str) -> Self {
        Self::new(format!("Duplicate entry '{value}' for key '{key}'"))
            .with_code(1062)
            .with_sql_state("23000")
    }

    pub fn server_gone_away() -> Self {
        Self::new("MySQL server has gone away").with_code(2006)
    }

    pub fn lost_connection() -> Self {
        Self::new("Lost connection to MySQL server during query").with_code(2013)
    }

    pub fn deadlock() -> Self {
        Self::new("Deadlock found when trying to get lock; try restarting transaction")
            .with_code(1213)
            .with_sql_state("40001")
    }

    pub fn lock_wait_timeout() -> Self {
        Self::new("Lock wait timeout exceeded; try restarting transaction").with_code(1205)
    }
}

/// Executes structured statements. Implementations render them with
/// [`crate::query::render`] (or evaluate them directly) on the connection the
/// role selects.
pub trait RelationalDriver: Send + Sync {
    /// Name the schema cache keys column types by.
    fn connection_name(&self) -> &str {
        "default"
    }

    fn execute(
        &self,
        role: ConnectionRole,
        statement: &Statement,
    ) -> impl Future<Output = Result<StatementOutput, DriverError>> + Send;

    fn reconnect(&self, role: ConnectionRole) -> impl Future<Output = Result<(), DriverError>> + Send;

    fn describe(&self, table: &str) -> impl Future<Output = Result<ColumnTypes, DriverError>> + Send;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Create only; conflicts with an existing document of the same id. A
    /// missing id lets the store assign one.
    Create {
        id: Option<String>,
        document: Map<String, JsonValue>,
    },
    /// Create or replace. A missing id lets the store assign one.
    Index {
        id: Option<String>,
        document: Map<String, JsonValue>,
    },
    /// Partial update; creates the document when it does not exist yet.
    Upsert {
        id: String,
        document: Map<String, JsonValue>,
    },
    /// Partial update of an existing document.
    Update {
        id: String,
        document: Map<String, JsonValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemStatus {
    pub id: Option<String>,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemStatus {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error.is_none()
    }
}

/// Per-operation statuses, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemStatus>,
}

impl BulkResponse {
    pub fn has_errors(&self) -> bool {
        self.items.iter().any(|i| !i.is_success())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("document store error ({status:?}): {message}")]
pub struct StoreError {
    pub status: Option<u16>,
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        GateError::FatalStorageFault {
            message: err.to_string(),
        }
    }
}

pub trait DocumentStore: Send + Sync {
    fn search(
        &self,
        index: &str,
        body: &JsonValue,
    ) -> impl Future<Output = Result<JsonValue, StoreError>> + Send;

    fn bulk(
        &self,
        index: &str,
        operations: Vec<BulkOperation>,
    ) -> impl Future<Output = Result<BulkResponse, StoreError>> + Send;

    /// Returns the number of deleted documents.
    fn delete_by_query(
        &self,
        index: &str,
        body: &JsonValue,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::{BulkItemStatus, DriverError, StoreError};
    use crate::error::GateError;

    #[test]
    fn canned_driver_errors_carry_server_codes() {
        assert_eq!(DriverError::duplicate_entry("A-1", "sku").code, Some(1062));
        assert_eq!(DriverError::deadlock().code, Some(1213));
        assert!(DriverError::server_gone_away().message.contains("gone away"));
    }

    #[test]
    fn bulk_status_success_needs_2xx_without_error() {
        let ok = BulkItemStatus {
            id: Some("1".into()),
            status: 201,
            error: None,
        };
        let rejected = BulkItemStatus {
            status: 400,
            error: Some("mapper_parsing_exception".into()),
            ..ok.clone()
        };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
    }

    #[test]
    fn store_errors_are_fatal() {
        let err: GateError = StoreError::new("index_not_found").with_status(404).into();
        assert_eq!(err.code_str(), "fatal_storage_fault");
    }
}
