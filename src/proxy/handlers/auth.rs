// Credential change: re-issue a tenant's token with new credentials
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::proxy::server::AppState;
use crate::proxy::token_manager::TokenRequest;

const DEFAULT_APP: &str = "mophic";

#[derive(Debug, Deserialize)]
pub struct ChangePasswordQuery {
    pub app: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChangePasswordRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": { "message": message } }))).into_response()
}

pub async fn handle_change_password(
    State(state): State<AppState>,
    Query(query): Query<ChangePasswordQuery>,
    body: Bytes,
) -> Response {
    let app = query
        .app
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .unwrap_or(DEFAULT_APP);

    // A body that is not a JSON object counts as missing fields
    let request: ChangePasswordRequest = serde_json::from_slice(&body).unwrap_or_default();

    let Some(username) = request.username.filter(|u| !u.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "username is required");
    };
    let Some(password) = request.password.filter(|p| !p.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "password is required");
    };

    if !state.token_manager.has_tenant(app) {
        return error_response(StatusCode::BAD_REQUEST, &format!("unknown app '{}'", app));
    }

    let unchanged = state
        .token_manager
        .is_current_payload(app, &username, &password)
        .await;

    match state
        .token_manager
        .get_token(app, TokenRequest::login(&username, &password))
        .await
    {
        Some(_) if unchanged => {
            tracing::info!(tenant = %app, user = %username, "Credentials unchanged, token re-issued");
            StatusCode::NO_CONTENT.into_response()
        }
        Some(_) => {
            tracing::info!(tenant = %app, user = %username, "Credentials updated");
            StatusCode::NO_CONTENT.into_response()
        }
        None => {
            tracing::warn!(tenant = %app, user = %username, "Credential change rejected");
            error_response(StatusCode::UNAUTHORIZED, "Invalid username or password")
        }
    }
}
