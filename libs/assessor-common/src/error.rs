use thiserror::Error;
use uuid::Uuid;

use crate::types::{ExecutionEnvironment, TestcaseType};

/// Errors surfaced by the grading engine to its callers.
///
/// Per-case timeouts, memory exhaustion and pending reviews are *not* errors;
/// they are recorded as outcomes.
#[derive(Debug, Error)]
pub enum AssessError {
    /// Malformed request, rejected before anything is dispatched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing, unknown or foreign session token.
    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("session expired")]
    SessionExpired,

    /// Catalog defect: the pair is outside the compatibility table.
    #[error("testcase type {testcase_type} is not supported by environment {environment}")]
    UnsupportedTestcaseType {
        environment: ExecutionEnvironment,
        testcase_type: TestcaseType,
    },

    #[error("a submission is already running for user challenge {0}")]
    SubmissionInProgress(Uuid),

    #[error("evaluation infrastructure unavailable after {attempts} attempts: {message}")]
    EvaluationInfrastructure { attempts: u32, message: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl AssessError {
    pub fn validation(message: impl Into<String>) -> Self {
        AssessError::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AssessError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code for the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            AssessError::Validation(_) => "validation_error",
            AssessError::SessionInvalid(_) => "session_invalid",
            AssessError::SessionExpired => "session_expired",
            AssessError::UnsupportedTestcaseType { .. } => "unsupported_testcase_type",
            AssessError::SubmissionInProgress(_) => "submission_in_progress",
            AssessError::EvaluationInfrastructure { .. } => "evaluation_infrastructure_error",
            AssessError::NotFound { .. } => "not_found",
            AssessError::Conflict(_) => "conflict",
            AssessError::Storage(_) => "storage_error",
        }
    }
}

impl From<redis::RedisError> for AssessError {
    fn from(err: redis::RedisError) -> Self {
        AssessError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AssessError {
    fn from(err: serde_json::Error) -> Self {
        AssessError::Storage(format!("serialization: {err}"))
    }
}

pub type AssessResult<T> = Result<T, AssessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_distinguish_session_failures() {
        assert_eq!(AssessError::SessionInvalid("x".into()).code(), "session_invalid");
        assert_eq!(AssessError::SessionExpired.code(), "session_expired");
    }

    #[test]
    fn test_unsupported_message_names_pair() {
        let err = AssessError::UnsupportedTestcaseType {
            environment: ExecutionEnvironment::CodeExecutor,
            testcase_type: TestcaseType::SqlQueryTest,
        };
        assert_eq!(
            err.to_string(),
            "testcase type sql_query_test is not supported by environment code_executor"
        );
    }
}
