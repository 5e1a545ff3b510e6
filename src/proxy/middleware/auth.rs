// API Key authentication middleware
use axum::{
    extract::{Request, State},
    http::Uri,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::GatewayError;
use crate::proxy::server::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests without the configured API key. The key may arrive as
/// header or query parameter; the query parameter is removed before the
/// request is forwarded.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let from_header = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let from_query = request.uri().query().and_then(query_api_key);

    let Some(provided) = from_header.or(from_query) else {
        tracing::warn!("Request: {} {} rejected, no API key", request.method(), request.uri().path());
        return GatewayError::Unauthorized("Access denied. No x-api-key provided".to_string())
            .into_response();
    };

    if provided != expected {
        tracing::warn!("Request: {} {} rejected, invalid API key", request.method(), request.uri().path());
        return GatewayError::BadRequest("Invalid x-api-key".to_string()).into_response();
    }

    if let Some(stripped) = strip_api_key(request.uri()) {
        *request.uri_mut() = stripped;
    }
    next.run(request).await
}

fn query_api_key(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, v)| k == API_KEY_HEADER && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

/// Same URI without the `x-api-key` query parameter, `None` when there is nothing to strip.
fn strip_api_key(uri: &Uri) -> Option<Uri> {
    let query = uri.query()?;
    let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(k, _)| k != API_KEY_HEADER)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let remaining = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let path_and_query = if remaining.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), remaining)
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = path_and_query.parse().ok();
    Uri::from_parts(parts).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_api_key() {
        assert_eq!(query_api_key("a=1&x-api-key=abc").as_deref(), Some("abc"));
        assert_eq!(query_api_key("x-api-key="), None);
        assert_eq!(query_api_key("a=1"), None);
    }

    #[test]
    fn test_strip_api_key() {
        let uri: Uri = "/api/Patient?x-api-key=abc&hn=1".parse().unwrap();
        assert_eq!(strip_api_key(&uri).unwrap(), "/api/Patient?hn=1");

        let uri: Uri = "/api/Patient?x-api-key=abc".parse().unwrap();
        assert_eq!(strip_api_key(&uri).unwrap(), "/api/Patient");

        let uri: Uri = "/api/Patient".parse().unwrap();
        assert!(strip_api_key(&uri).is_none());
    }
}
