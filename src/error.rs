//! Gateway error types
//!
//! Defines the error taxonomy shared by the auth gate, the provider drivers,
//! and the admin surface. Every error renders as
//! `{"error": {"type": ..., "message": ...}}` with the matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Error taxonomy for client-visible failures
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Missing or malformed authentication
    Unauthorized(String),
    /// Subject is known but disabled, or the model is not allowed
    Forbidden(String),
    /// Account budget exhausted
    BudgetExceeded(String),
    /// Malformed request body or parameters
    InvalidRequest(String),
    /// Requested resource does not exist (gateway-side or upstream 404)
    NotFound(String),
    /// Upstream rejected the gateway's provider credentials
    UpstreamAuth(String),
    /// Upstream rate limit hit
    UpstreamRateLimited(String),
    /// Upstream unreachable or returned a server error
    UpstreamUnavailable(String),
    /// Upstream did not answer in time
    UpstreamTimeout(String),
    /// Anything else
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::BudgetExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamAuth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable `type` string carried in the error envelope
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "authentication_error",
            GatewayError::Forbidden(_) => "authorization_error",
            GatewayError::BudgetExceeded(_) => "budget_exceeded",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::UpstreamAuth(_) => "upstream_auth_error",
            GatewayError::UpstreamRateLimited(_) => "rate_limit_exceeded",
            GatewayError::UpstreamUnavailable(_) => "service_unavailable",
            GatewayError::UpstreamTimeout(_) => "timeout_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::Unauthorized(msg)
            | GatewayError::Forbidden(msg)
            | GatewayError::BudgetExceeded(msg)
            | GatewayError::InvalidRequest(msg)
            | GatewayError::NotFound(msg)
            | GatewayError::UpstreamAuth(msg)
            | GatewayError::UpstreamRateLimited(msg)
            | GatewayError::UpstreamUnavailable(msg)
            | GatewayError::UpstreamTimeout(msg)
            | GatewayError::Internal(msg) => msg,
        }
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for GatewayError {}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(format!("store error: {}", e))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Internal(format!("serialization error: {}", e))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), kind, message = self.message(), "request failed");
        } else {
            tracing::warn!(status = status.as_u16(), kind, message = self.message(), "request rejected");
        }

        (
            status,
            Json(serde_json::json!({
                "error": {
                    "type": kind,
                    "message": self.message()
                }
            })),
        )
            .into_response()
    }
}

/// Result alias used across the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_kind_mapping() {
        let cases = [
            (GatewayError::Unauthorized("x".into()), 401, "authentication_error"),
            (GatewayError::Forbidden("x".into()), 403, "authorization_error"),
            (GatewayError::BudgetExceeded("x".into()), 429, "budget_exceeded"),
            (GatewayError::InvalidRequest("x".into()), 400, "invalid_request_error"),
            (GatewayError::NotFound("x".into()), 404, "not_found_error"),
            (GatewayError::UpstreamAuth("x".into()), 401, "upstream_auth_error"),
            (GatewayError::UpstreamRateLimited("x".into()), 429, "rate_limit_exceeded"),
            (GatewayError::UpstreamUnavailable("x".into()), 503, "service_unavailable"),
            (GatewayError::UpstreamTimeout("x".into()), 504, "timeout_error"),
            (GatewayError::Internal("x".into()), 500, "internal_error"),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.kind(), kind);
        }
    }
}
