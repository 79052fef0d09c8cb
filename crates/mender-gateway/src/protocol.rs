//! Gateway HTTP protocol: JSON bodies and error mapping

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use mender_core::{
    DebugReport, ExecutionResult, FixResult, NoFixPolicy, RequestError, SessionError,
};
use mender_core::diagnostics::Diagnostic;

/// Body of `/api/execute` and `/api/debug`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub language: String,
    pub code: String,
}

/// Body of `/api/auto-retry` and `POST /api/sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRequest {
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub message: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugResponse {
    pub message: String,
    pub result: ExecutionResult,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
    pub ai_fix: Option<FixResult>,
}

impl From<DebugReport> for DebugResponse {
    fn from(report: DebugReport) -> Self {
        Self {
            message: "Execution completed".to_string(),
            result: report.result,
            diagnostics: report.diagnostics,
            ai_fix: report.fix,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub languages: Vec<String>,
    pub active_sessions: usize,
    /// Paced sessions accepted before `POST /api/sessions` returns 503
    pub session_capacity: usize,
    pub on_no_fix: NoFixPolicy,
    pub primary_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
}

/// Error body: `detail` is human-readable, `code` is stable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
}

/// Error returned from a handler
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        let code = match &err {
            RequestError::UnsupportedLanguage(_) => "unsupported_language",
            RequestError::EmptyCode => "empty_code",
            RequestError::CodeTooLong { .. } => "code_too_long",
            RequestError::InvalidMaxAttempts { .. } => "invalid_max_attempts",
            RequestError::Unsafe(_) => "unsafe_code",
        };
        Self::new(StatusCode::BAD_REQUEST, code, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let (status, code) = match &err {
            SessionError::Request(inner) => return inner.clone().into(),
            SessionError::NotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
            SessionError::AlreadyComplete(_) => (StatusCode::CONFLICT, "session_complete"),
            SessionError::Cancelled(_) => (StatusCode::CONFLICT, "session_cancelled"),
            SessionError::CapacityReached(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "capacity_reached")
            }
            SessionError::InvalidId(_) => (StatusCode::BAD_REQUEST, "invalid_session_id"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code.to_string(),
            detail: self.detail,
        };
        (self.status, Json(body)).into_response()
    }
}
