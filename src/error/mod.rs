use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed route or policy rejected at the administrative boundary
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Rate limit policy not found: {0}")]
    PolicyNotFound(String),

    /// Optimistic concurrency check failed on update
    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("No targets configured for route: {0}")]
    NoTargetsConfigured(String),

    #[error("Request blocked for country {country} on route {route_id}")]
    GeoBlocked { route_id: String, country: String },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Rate limit store unavailable: {0}")]
    RateLimitStoreUnavailable(String),

    #[error("Route repository unavailable: {0}")]
    RouteRepositoryUnavailable(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::PolicyNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::NoTargetsConfigured(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GeoBlocked { .. } => StatusCode::FORBIDDEN,
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimitStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteRepositoryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Proxy(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::NoTargetsConfigured("orders".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::GeoBlocked {
                route_id: "orders".to_string(),
                country: "XX".to_string()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::Validation("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Timeout("test".to_string()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::Conflict("v1".to_string()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 16 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::GeoBlocked {
            route_id: "orders".to_string(),
            country: "KP".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Request blocked for country KP on route orders"
        );
    }
}
