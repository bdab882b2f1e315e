//! # Error Handling
//!
//! Unified error responses for the management API. Every failure is rendered as
//! `{success:false, message, code}` with optional details and the request's
//! correlation id.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::sync::error::{SyncError, SyncErrorKind};
use crate::sync::task_manager::TaskManagerError;
use crate::telemetry;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    /// Always `false`
    pub success: bool,
    /// Human-readable error message
    pub message: Box<str>,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation id for log lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            success: false,
            message: message.into().into_boxed_str(),
            code: code.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        let status = match error.kind {
            SyncErrorKind::Configuration
            | SyncErrorKind::InvalidSnapshot
            | SyncErrorKind::SourceSchemaError
            | SyncErrorKind::CyclicHierarchy => StatusCode::BAD_REQUEST,
            SyncErrorKind::LockContention | SyncErrorKind::ConflictUnresolved => {
                StatusCode::CONFLICT
            }
            SyncErrorKind::SourceUnavailable | SyncErrorKind::TargetRejected { .. } => {
                StatusCode::BAD_GATEWAY
            }
            SyncErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            SyncErrorKind::Cancelled => StatusCode::CONFLICT,
            SyncErrorKind::Storage => {
                tracing::error!(error = %error, "sync storage failure");
                return Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                );
            }
        };

        let mut api = Self::new(status, error.kind.code(), &error.message);
        if let Ok(value) = serde_json::to_value(&error) {
            api = api.with_details(value);
        }
        if matches!(error.kind, SyncErrorKind::LockContention) {
            api = api.with_retry_after(5);
        }
        api
    }
}

impl From<TaskManagerError> for ApiError {
    fn from(error: TaskManagerError) -> Self {
        match error {
            TaskManagerError::NotFound(what) => not_found(what),
            TaskManagerError::InvalidState(message) => {
                ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", &message)
            }
            TaskManagerError::Sync(error) => error.into(),
        }
    }
}

pub fn not_found(what: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", &format!("{what} not found"))
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
