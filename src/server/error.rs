use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::QueryError;

/// Client-facing failure. Everything rendered here is safe to show: backend
/// messages never reach the body.
#[derive(Debug)]
pub enum ApiError {
    Query(QueryError),
    BadRequest(String),
    Forbidden,
    NotFound(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    status: &'static str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<&'static str>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    violations: Option<&'a [String]>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Query(err) => match err {
                QueryError::RequestShape { .. } | QueryError::Validation { .. } => {
                    StatusCode::BAD_REQUEST
                }
                QueryError::Connection { .. } => StatusCode::SERVICE_UNAVAILABLE,
                QueryError::Execution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                QueryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError::Query(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let envelope = match &self {
            ApiError::Query(err) => ErrorEnvelope {
                status: "error",
                kind: err.kind(),
                stage: Some(err.stage().as_str()),
                message: match err {
                    QueryError::Execution { .. } => "query execution failed".to_string(),
                    QueryError::Connection { target, .. } => {
                        format!("{} connection unavailable", target)
                    }
                    other => other.to_string(),
                },
                violations: match err {
                    QueryError::Validation { violations, .. } => Some(violations.as_slice()),
                    _ => None,
                },
            },
            ApiError::BadRequest(message) => ErrorEnvelope {
                status: "error",
                kind: "request_shape_error",
                stage: None,
                message: message.clone(),
                violations: None,
            },
            ApiError::Forbidden => ErrorEnvelope {
                status: "error",
                kind: "authentication_error",
                stage: None,
                message: "missing or invalid API key".to_string(),
                violations: None,
            },
            ApiError::NotFound(message) => ErrorEnvelope {
                status: "error",
                kind: "not_found",
                stage: None,
                message: message.clone(),
                violations: None,
            },
            ApiError::Internal(message) => ErrorEnvelope {
                status: "error",
                kind: "internal_error",
                stage: None,
                message: message.clone(),
                violations: None,
            },
        };
        (status, Json(envelope)).into_response()
    }
}
