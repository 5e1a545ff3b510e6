use crate::proxy::cache::KeyValueCache;
use crate::proxy::handlers;
use crate::proxy::upstream::ClientRegistry;
use crate::proxy::TokenManager;
use axum::{
    extract::{DefaultBodyLimit, State},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Axum application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub token_manager: Arc<TokenManager>,
    pub cache: Arc<KeyValueCache>,
    /// Inbound API key, `None` = guard disabled
    pub api_key: Option<Arc<str>>,
}

/// Build routes
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/auth/change-password",
            post(handlers::auth::handle_change_password),
        )
        .route("/api", any(handlers::proxy::handle_proxy))
        .route("/api/*path", any(handlers::proxy::handle_proxy))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::proxy::middleware::auth_middleware,
        ));

    Router::new()
        .merge(api)
        .route("/healthz", get(health_check_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(100 * 1024 * 1024)),
        )
        .with_state(state)
}

/// Axum server instance
pub struct AxumServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AxumServer {
    /// Start Axum server
    pub async fn start(
        host: &str,
        port: u16,
        state: AppState,
    ) -> Result<(Self, tokio::task::JoinHandle<()>), String> {
        let app = build_router(state);

        // Bind address
        let addr = format!("{}:{}", host, port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind address {}: {}", addr, e))?;

        tracing::info!("Gateway listening at http://{}", addr);

        // Create shutdown channel
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let server_instance = Self {
            shutdown_tx: Some(shutdown_tx),
        };

        // Start server in new task
        let handle = tokio::spawn(async move {
            use hyper::server::conn::http1;
            use hyper_util::rt::TokioIo;
            use hyper_util::service::TowerToHyperService;

            loop {
                tokio::select! {
                    res = listener.accept() => {
                        match res {
                            Ok((stream, _)) => {
                                let io = TokioIo::new(stream);
                                let service = TowerToHyperService::new(app.clone());

                                tokio::task::spawn(async move {
                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Connection handling finished or errored: {:?}", err);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        tracing::info!("Gateway stopped listening");
                        break;
                    }
                }
            }
        });

        Ok((server_instance, handle))
    }

    /// Stop server
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Health check handler
async fn health_check_handler(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "cache": state.cache.backend_state().as_str(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::ProxyConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn state(upstream_uri: &str, api_key: Option<&str>) -> AppState {
        let mut config = ProxyConfig {
            hospital_code: "10670".to_string(),
            ..ProxyConfig::default()
        };
        for target in config.upstreams.values_mut() {
            target.base_url = upstream_uri.to_string();
        }
        let cache = Arc::new(KeyValueCache::local());
        cache.set("mophic-auth-token", "tok").await;
        let token_manager = Arc::new(TokenManager::new(&config, cache.clone(), reqwest::Client::new()));
        let registry = Arc::new(ClientRegistry::from_config(&config, token_manager.clone()).unwrap());
        AppState {
            registry,
            token_manager,
            cache,
            api_key: api_key.map(Arc::from),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_reports_cache_backend() {
        let app = build_router(state("http://127.0.0.1:1", Some("k")).await);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "status": "ok", "cache": "local" })
        );
    }

    #[tokio::test]
    async fn test_api_key_missing_and_invalid() {
        let upstream = MockServer::start().await;
        let app = build_router(state(&upstream.uri(), Some("secret")).await);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            json_body(response).await,
            json!({ "message": "Access denied. No x-api-key provided" })
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/x")
                    .header("x-api-key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(upstream.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_key_query_is_stripped() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&upstream)
            .await;

        let app = build_router(state(&upstream.uri(), Some("secret")).await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/x?x-api-key=secret&hn=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let received = upstream.received_requests().await.unwrap();
        assert_eq!(received[0].url.query(), Some("hn=5"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (server, handle) = AxumServer::start("127.0.0.1", 0, state("http://127.0.0.1:1", None).await)
            .await
            .unwrap();
        server.stop();
        handle.await.unwrap();
    }
}
