//! Error-to-HTTP response conversion.
//!
//! Handlers return `Result<T, ApiError>`; the body is always
//! `{"error": {"code", "message"}}`. Server-side failures keep their code
//! but replace the message, so driver text and paths stay in the log.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use transforge_common::{Error, ValidationError};

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self(e.into())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ValidationError::Unsupported(rejection.body_text()).into())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ValidationError::Unsupported(rejection.body_text()).into())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ValidationError::Unsupported(rejection.body_text()).into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "Server error in API handler");
        }

        let message = if self.0.is_caller_visible() {
            self.0.to_string()
        } else {
            "internal server error".to_string()
        };

        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
