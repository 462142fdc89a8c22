use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;

/// Errors surfaced by the message bus adapter.
///
/// Callers branch on retryability: retryable errors are absorbed by local
/// backoff (gateway) or the circuit breaker (worker); fatal errors are
/// never retried.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus temporarily unavailable: {reason}")]
    Retryable { reason: String, backoff: Duration },
    #[error("bus rejected the record: {0}")]
    Fatal(String),
}

impl BusError {
    pub fn retryable(reason: impl Into<String>, backoff: Duration) -> Self {
        BusError::Retryable {
            reason: reason.into(),
            backoff,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Retryable { .. })
    }
}

/// Errors surfaced by the columnar store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, timeout or pool-exhaustion class failures. Safe to retry.
    #[error("store temporarily unavailable: {0}")]
    Retryable(String),
    /// Schema violations and malformed statements. The offending batch must
    /// be dropped and reported, not retried.
    #[error("store rejected the request: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Retryable(_))
    }
}

/// Machine-readable HTTP error: `{code, message, details?}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn unauthorized() -> Self {
        // No detail leaked on credential failures.
        Self::new(StatusCode::UNAUTHORIZED, "auth", "missing or invalid API key")
    }

    pub fn invalid_query(message: impl Into<String>, token: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_query", message)
            .with_details(json!({ "token": token }))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "dependency_retryable", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Retryable(reason) => {
                tracing::warn!(reason, "store unavailable while serving query");
                ApiError::unavailable("storage temporarily unavailable")
            }
            StoreError::Fatal(reason) => {
                tracing::error!(reason, "store rejected query");
                ApiError::internal("storage rejected the query")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_classify_retryability() {
        assert!(StoreError::Retryable("timeout".into()).is_retryable());
        assert!(!StoreError::Fatal("schema mismatch".into()).is_retryable());
    }

    #[test]
    fn bus_errors_classify_retryability() {
        let err = BusError::retryable("partition full", Duration::from_millis(100));
        assert!(err.is_retryable());
        assert!(!BusError::Fatal("oversized payload".into()).is_retryable());
    }
}
