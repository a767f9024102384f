use assessor_common::error::AssessError;
use assessor_engine::harness::{ImportError, RowError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::metrics;

/// Every handler error, rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    Assess(AssessError),
    ImportRows(Vec<RowError>),
}

impl From<AssessError> for ApiError {
    fn from(err: AssessError) -> Self {
        ApiError::Assess(err)
    }
}

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        match err {
            ImportError::Rows(rows) => ApiError::ImportRows(rows),
            ImportError::Assess(e) => ApiError::Assess(e),
        }
    }
}

pub fn status_of(err: &AssessError) -> StatusCode {
    match err {
        AssessError::Validation(_) => StatusCode::BAD_REQUEST,
        AssessError::SessionInvalid(_) | AssessError::SessionExpired => StatusCode::UNAUTHORIZED,
        AssessError::NotFound { .. } => StatusCode::NOT_FOUND,
        AssessError::SubmissionInProgress(_) | AssessError::Conflict(_) => StatusCode::CONFLICT,
        AssessError::EvaluationInfrastructure { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AssessError::UnsupportedTestcaseType { .. } | AssessError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Assess(err) => {
                let status = status_of(&err);
                if status.is_server_error() {
                    error!(code = err.code(), error = %err, "request failed");
                } else {
                    warn!(code = err.code(), error = %err, "request rejected");
                }
                metrics::REJECTIONS.with_label_values(&[err.code()]).inc();
                let body = json!({
                    "error": ErrorBody {
                        code: err.code(),
                        message: err.to_string(),
                    }
                });
                (status, Json(body)).into_response()
            }
            ApiError::ImportRows(rows) => {
                warn!(invalid_rows = rows.len(), "import rejected");
                metrics::REJECTIONS.with_label_values(&["validation_error"]).inc();
                let body = json!({
                    "error": ErrorBody {
                        code: "validation_error",
                        message: format!("{} rows are invalid", rows.len()),
                    },
                    "rows": rows,
                });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
