//! Structured HTTP errors.

use crate::error::Error;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::error;

/// An [`Error`] on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn json_error(code: StatusCode, message: &str, details: Option<Value>) -> Response {
    let mut body = json!({ "success": false, "error": message });
    if let (Some(Value::Object(extra)), Some(obj)) = (details, body.as_object_mut()) {
        obj.extend(extra);
    }
    (code, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            Error::Validation(msg) => json_error(
                StatusCode::BAD_REQUEST,
                "Invalid request",
                Some(json!({ "details": msg })),
            ),
            Error::CapacityExceeded(reason) => json_error(
                StatusCode::CONFLICT,
                "Capacity exceeded",
                Some(json!({ "reason": reason })),
            ),
            Error::NotFound(what) => json_error(
                StatusCode::NOT_FOUND,
                "Not found",
                Some(json!({ "resource": what })),
            ),
            Error::Unauthorized => json_error(StatusCode::UNAUTHORIZED, "Unauthorized", None),
            Error::ShuttingDown => {
                json_error(StatusCode::SERVICE_UNAVAILABLE, "Shutting down", None)
            }
            other => {
                error!("Request failed: {other}");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error", None)
            }
        }
    }
}
