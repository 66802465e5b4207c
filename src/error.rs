use crate::commit::uniqueness::UniquenessConflictReport;
use crate::query::error::QueryError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFault {
    ConnectionLost,
    Deadlock,
}

impl std::fmt::Display for TransientFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransientFault::ConnectionLost => write!(f, "connection lost"),
            TransientFault::Deadlock => write!(f, "deadlock"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateErrorCode {
    FilterNotSpecified,
    EmptyBatch,
    EmptyResult,
    NoChangesDetected,
    UniquenessConflict,
    DuplicateKey,
    TransientStorageFault,
    FatalStorageFault,
    InvalidBatchShape,
    UnauthorizedFieldAccess,
    UnknownOperator,
    InvalidFilter,
    InvalidConfig,
    Decode,
    InvalidQuery,
}

impl GateErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            GateErrorCode::FilterNotSpecified => "filter_not_specified",
            GateErrorCode::EmptyBatch => "empty_batch",
            GateErrorCode::EmptyResult => "empty_result",
            GateErrorCode::NoChangesDetected => "no_changes_detected",
            GateErrorCode::UniquenessConflict => "uniqueness_conflict",
            GateErrorCode::DuplicateKey => "duplicate_key",
            GateErrorCode::TransientStorageFault => "transient_storage_fault",
            GateErrorCode::FatalStorageFault => "fatal_storage_fault",
            GateErrorCode::InvalidBatchShape => "invalid_batch_shape",
            GateErrorCode::UnauthorizedFieldAccess => "unauthorized_field_access",
            GateErrorCode::UnknownOperator => "unknown_operator",
            GateErrorCode::InvalidFilter => "invalid_filter",
            GateErrorCode::InvalidConfig => "invalid_config",
            GateErrorCode::Decode => "decode",
            GateErrorCode::InvalidQuery => "invalid_query",
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("refusing to delete from '{entity}' without a filter")]
    FilterNotSpecified { entity: String },
    #[error("empty batch for {operation}")]
    EmptyBatch { operation: &'static str },
    #[error("no records matched for {operation}")]
    EmptyResult { operation: &'static str },
    #[error("no changes detected for '{entity}'")]
    NoChangesDetected { entity: String },
    #[error("uniqueness conflict: {0}")]
    UniquenessConflict(Box<UniquenessConflictReport>),
    #[error("duplicate key in '{entity}': {message}")]
    DuplicateKey { entity: String, message: String },
    #[error("{fault} persisted after {attempts} attempts: {message}")]
    TransientStorageFault {
        fault: TransientFault,
        attempts: u32,
        message: String,
    },
    #[error("storage fault: {message}")]
    FatalStorageFault { message: String },
    #[error("invalid batch: {0}")]
    InvalidBatchShape(String),
    #[error("filtering on '{field}' is not allowed for '{entity}'")]
    UnauthorizedFieldAccess { entity: String, field: String },
    #[error("unknown operator '{operator}' for field '{field}'")]
    UnknownOperator { field: String, operator: String },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl GateError {
    pub fn code(&self) -> GateErrorCode {
        match self {
            GateError::FilterNotSpecified { .. } => GateErrorCode::FilterNotSpecified,
            GateError::EmptyBatch { .. } => GateErrorCode::EmptyBatch,
            GateError::EmptyResult { .. } => GateErrorCode::EmptyResult,
            GateError::NoChangesDetected { .. } => GateErrorCode::NoChangesDetected,
            GateError::UniquenessConflict(_) => GateErrorCode::UniquenessConflict,
            GateError::DuplicateKey { .. } => GateErrorCode::DuplicateKey,
            GateError::TransientStorageFault { .. } => GateErrorCode::TransientStorageFault,
            GateError::FatalStorageFault { .. } => GateErrorCode::FatalStorageFault,
            GateError::InvalidBatchShape(_) => GateErrorCode::InvalidBatchShape,
            GateError::UnauthorizedFieldAccess { .. } => GateErrorCode::UnauthorizedFieldAccess,
            GateError::UnknownOperator { .. } => GateErrorCode::UnknownOperator,
            GateError::InvalidFilter(_) => GateErrorCode::InvalidFilter,
            GateError::InvalidConfig { .. } => GateErrorCode::InvalidConfig,
            GateError::Decode(_) => GateErrorCode::Decode,
            GateError::Query(_) => GateErrorCode::InvalidQuery,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for failures raised before anything reached a backend.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            GateError::FilterNotSpecified { .. }
                | GateError::EmptyBatch { .. }
                | GateError::NoChangesDetected { .. }
                | GateError::UniquenessConflict(_)
                | GateError::DuplicateKey { .. }
                | GateError::InvalidBatchShape(_)
                | GateError::UnauthorizedFieldAccess { .. }
                | GateError::UnknownOperator { .. }
                | GateError::InvalidFilter(_)
        )
    }
}
