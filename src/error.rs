use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::proxy::upstream::UpstreamError;

/// Methods the gateway forwards upstream
pub const ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),
}

// Implement alias for Result to simplify usage
pub type AppResult<T> = Result<T, AppError>;

/// Request-level failures detected by the gateway itself.
///
/// This is the only place client-facing error bodies are formatted.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Unsupported Content-Type: {0}")]
    UnsupportedMediaType(String),

    #[error("proxy error: allow only GET, POST, PUT, PATCH and DELETE method.")]
    MethodNotAllowed,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("upstream request timeout")]
    UpstreamTimeout {
        detail: String,
        endpoint: String,
        url: String,
        timeout_ms: u64,
    },

    #[error("{0}")]
    BadGateway(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn from_upstream(endpoint: &str, error: UpstreamError) -> Self {
        match error {
            UpstreamError::TokenUnavailable { .. } => GatewayError::Unauthorized(error.to_string()),
            UpstreamError::Timeout {
                url,
                timeout_ms,
                source,
            } => GatewayError::UpstreamTimeout {
                detail: source.to_string(),
                endpoint: endpoint.to_string(),
                url,
                timeout_ms,
            },
            other => GatewayError::BadGateway(other.to_string()),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        let body = match &self {
            GatewayError::UnsupportedMediaType(mime) if mime.is_empty() => {
                json!({ "message": "Unsupported Content-Type" })
            }
            GatewayError::UpstreamTimeout {
                detail,
                endpoint,
                url,
                timeout_ms,
            } => json!({
                "message": message,
                "detail": detail,
                "endpoint": endpoint,
                "url": url,
                "timeoutMs": timeout_ms,
            }),
            _ => json!({ "message": message }),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Gateway error");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, GatewayError::MethodNotAllowed) {
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
        }
        response
    }
}
