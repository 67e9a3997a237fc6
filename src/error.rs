use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Insufficient credits")]
    InsufficientCredits { required: f64, available: f64 },

    #[error("Rate limit exceeded")]
    RateLimited {
        limit: i64,
        current: i64,
        retry_after_secs: Option<i64>,
    },

    #[error("Provider temporarily unavailable")]
    CircuitOpen { retry_after_secs: i64 },

    #[error("Concurrent balance update, please retry")]
    ConcurrentUpdate,

    /// Sanitized upstream failure. Never carries provider identity or raw
    /// upstream text; `retryable` distinguishes timeouts/5xx from terminal 4xx.
    #[error("Generation failed")]
    Provider { retryable: bool },

    #[error("Internal error")]
    InternalError,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidApiKey => "invalid_api_key",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::InsufficientCredits { .. } => "insufficient_credits",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::CircuitOpen { .. } => "circuit_open",
            ApiError::ConcurrentUpdate => "concurrent_update",
            ApiError::Provider { retryable: true } => "provider_error_retryable",
            ApiError::Provider { retryable: false } => "provider_error",
            ApiError::InternalError | ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::InvalidApiKey => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::InsufficientCredits {
                required,
                available,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": self.to_string(),
                    "code": self.code(),
                    "required": required,
                    "available": available,
                }),
            ),
            ApiError::RateLimited {
                limit,
                current,
                retry_after_secs,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": self.to_string(),
                    "code": self.code(),
                    "limit": limit,
                    "current": current,
                    "retry_after_secs": retry_after_secs,
                }),
            ),
            ApiError::CircuitOpen { retry_after_secs } => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": self.to_string(),
                    "code": self.code(),
                    "retry_after_secs": retry_after_secs,
                }),
            ),
            ApiError::ConcurrentUpdate => (
                StatusCode::CONFLICT,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::Provider { .. } => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": self.to_string(), "code": self.code() }),
            ),
            ApiError::InternalError | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Internal error", "code": self.code() }),
            ),
        };

        let retry_after = match &self {
            ApiError::CircuitOpen { retry_after_secs } => Some(*retry_after_secs),
            ApiError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.max(0).to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(_: sqlx::Error) -> Self {
        ApiError::InternalError
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_detail_never_reaches_body() {
        let response = ApiError::Internal("database dsn leaked".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn circuit_open_sets_retry_after_header() {
        let response = ApiError::CircuitOpen {
            retry_after_secs: 42,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "42"
        );
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            ApiError::Provider { retryable: true }.code(),
            "provider_error_retryable"
        );
        assert_eq!(ApiError::ConcurrentUpdate.code(), "concurrent_update");
    }
}
