use thiserror::Error;

use crate::execution::ExecutionStatus;

/// Errors from state and checkpoint store operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid status transition from '{from}' to '{to}'")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = RepositoryError::InvalidTransition {
            from: ExecutionStatus::Completed,
            to: ExecutionStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition from 'completed' to 'running'"
        );
    }
}
