use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    ColumnNotFound {
        table: String,
        column: String,
    },
    InvalidQuery {
        reason: String,
    },
    UnsupportedClause {
        backend: &'static str,
        clause: String,
    },
    ExpressionTooDeep {
        depth: usize,
        max: usize,
    },
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::ColumnNotFound { table, column } => {
                write!(f, "column '{column}' not found in table '{table}'")
            }
            QueryError::InvalidQuery { reason } => write!(f, "invalid query: {reason}"),
            QueryError::UnsupportedClause { backend, clause } => {
                write!(f, "{backend} backend does not support {clause}")
            }
            QueryError::ExpressionTooDeep { depth, max } => {
                write!(f, "expression depth {depth} exceeds maximum allowed depth of {max}")
            }
        }
    }
}

impl std::error::Error for QueryError {}

#[cfg(test)]
mod tests {
    use super::QueryError;

    #[test]
    fn query_error_display_is_human_readable() {
        let err = QueryError::ColumnNotFound {
            table: "products".into(),
            column: "colour".into(),
        };
        assert_eq!(
            err.to_string(),
            "column 'colour' not found in table 'products'"
        );
        let err = QueryError::UnsupportedClause {
            backend: "document",
            clause: "joins".into(),
        };
        assert_eq!(err.to_string(), "document backend does not support joins");
    }
}
