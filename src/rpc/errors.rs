//! HTTP API error types
//!
//! Errors are returned as `{"error": {"code", "message", "retryable"}}` with
//! a matching HTTP status.

use http::StatusCode;
use serde_json::{json, Value};
use std::fmt;

use crate::module::traits::ExecError;

/// API error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// Body is not valid JSON or not a valid RunRequest (400)
    InvalidRequest,
    /// Unknown run id or route (404)
    NotFound,
    /// Route exists, method does not (405)
    MethodNotAllowed,
    /// Body above the accepted size (413)
    PayloadTooLarge,
    /// Executor failure (500)
    InternalError,
}

impl ApiErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidRequest => "invalid_request",
            ApiErrorCode::NotFound => "not_found",
            ApiErrorCode::MethodNotAllowed => "method_not_allowed",
            ApiErrorCode::PayloadTooLarge => "payload_too_large",
            ApiErrorCode::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::InvalidRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message)
    }

    pub fn method_not_allowed(method: &str) -> Self {
        Self::new(
            ApiErrorCode::MethodNotAllowed,
            format!("Method {} not allowed", method),
        )
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            ApiErrorCode::PayloadTooLarge,
            format!("Request body exceeds {} bytes", limit),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(ApiErrorCode::InternalError, message)
        }
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.retryable,
            }
        })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code.as_str())
    }
}

impl std::error::Error for ApiError {}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::InternalError(ref detail) => ApiError::internal_error(detail.clone()),
            other => ApiError::invalid_request(other.to_string()),
        }
    }
}
