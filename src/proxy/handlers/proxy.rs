// Forwarding handler for everything under /api
use axum::{
    body::Body,
    extract::{FromRequest, Multipart, Request, State},
    http::{header, HeaderMap, Method},
    response::Response,
};
use serde_json::Value;

use crate::error::GatewayError;
use crate::proxy::server::AppState;
use crate::proxy::upstream::{MultipartPayload, OutboundBody};

pub const API_PREFIX: &str = "/api";
pub const ENDPOINT_HEADER: &str = "x-api-endpoint";
pub const ENDPOINT_PARAM: &str = "endpoint";

/// Upper bound for buffered (non-multipart) request bodies
const MAX_BUFFERED_BODY: usize = 100 * 1024 * 1024;

const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub async fn handle_proxy(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, GatewayError> {
    let method = request.method().clone();
    if !is_forwarded_method(&method) {
        return Err(GatewayError::MethodNotAllowed);
    }

    let (selector, query) = split_query(request.headers(), request.uri().query());
    let client = state.registry.select(selector.as_deref());

    let path = forwarded_path(request.uri().path()).to_string();
    let url = client.url_for(&path, query.as_deref());
    tracing::debug!(endpoint = %client.name(), method = %method, url = %url, "Forwarding request");

    let body = if method == Method::POST {
        post_body(&state, request).await?
    } else {
        let content_type = header_str(request.headers(), header::CONTENT_TYPE).map(str::to_string);
        let bytes = axum::body::to_bytes(request.into_body(), MAX_BUFFERED_BODY)
            .await
            .map_err(|e| GatewayError::BadRequest(format!("cannot read request body: {}", e)))?;
        OutboundBody::raw(bytes, content_type)
    };

    let response = client
        .send(method, &url, &body)
        .await
        .map_err(|e| GatewayError::from_upstream(client.name(), e))?;

    if !response.status().is_success() {
        tracing::warn!(
            endpoint = %client.name(),
            url = %url,
            status = response.status().as_u16(),
            "Upstream answered with error status"
        );
    }
    Ok(relay(response))
}

async fn post_body(state: &AppState, request: Request) -> Result<OutboundBody, GatewayError> {
    let mime = mime_type(request.headers());
    match mime.as_str() {
        "application/json" => {
            let bytes = axum::body::to_bytes(request.into_body(), MAX_BUFFERED_BODY)
                .await
                .map_err(|e| GatewayError::BadRequest(format!("cannot read request body: {}", e)))?;
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {}", e)))?;
            Ok(OutboundBody::Json(value))
        }
        "multipart/form-data" => {
            let multipart = Multipart::from_request(request, state)
                .await
                .map_err(|e| GatewayError::BadRequest(e.body_text()))?;
            Ok(OutboundBody::Multipart(spool_multipart(multipart).await?))
        }
        _ => Err(GatewayError::UnsupportedMediaType(mime)),
    }
}

async fn spool_multipart(mut multipart: Multipart) -> Result<MultipartPayload, GatewayError> {
    let mut payload = MultipartPayload::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field.content_type().map(str::to_string);
                payload
                    .add_file(&name, Some(file_name), content_type, field)
                    .await
                    .map_err(|e| GatewayError::BadRequest(format!("cannot read file part '{}': {}", name, e)))?;
            }
            None => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| GatewayError::BadRequest(format!("invalid multipart field '{}': {}", name, e)))?;
                payload.add_field(&name, value);
            }
        }
    }

    tracing::debug!(
        fields = payload.field_count(),
        files = payload.file_count(),
        "Multipart body spooled"
    );
    Ok(payload)
}

/// Pass the upstream response through: status, end-to-end headers, streamed body.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn is_forwarded_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Lower-cased media type without parameters, empty when absent.
pub fn mime_type(headers: &HeaderMap) -> String {
    header_str(headers, header::CONTENT_TYPE)
        .unwrap_or_default()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Path relative to the mount point.
pub fn forwarded_path(path: &str) -> &str {
    path.strip_prefix(API_PREFIX).unwrap_or(path)
}

/// Extract the endpoint selector and the query string to forward.
///
/// The header wins over the query parameter. The forwarded query keeps every
/// other pair, sorted by key (stable for repeated keys).
pub fn split_query(headers: &HeaderMap, query: Option<&str>) -> (Option<String>, Option<String>) {
    let mut from_query = None;
    let mut pairs: Vec<(String, String)> = Vec::new();

    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        if key == ENDPOINT_PARAM {
            if from_query.is_none() && !value.is_empty() {
                from_query = Some(value.into_owned());
            }
        } else {
            pairs.push((key.into_owned(), value.into_owned()));
        }
    }
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let from_header = header_str(headers, header::HeaderName::from_static(ENDPOINT_HEADER))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let forwarded = if pairs.is_empty() {
        None
    } else {
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish(),
        )
    };

    (from_header.or(from_query), forwarded)
}
