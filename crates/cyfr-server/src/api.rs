use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use cyfr_shared::constants::RELAY_WS_PATH;

use crate::config::ServerConfig;
use crate::connection::serve_link;
use crate::error::ServerError;
use crate::hub::HubHandle;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    let mut router = Router::new()
        .route(RELAY_WS_PATH, get(relay_ws))
        .route("/health", get(health_check))
        .route("/info", get(server_info));

    if let Some(dir) = &state.config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the server fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    peers: usize,
    max_peers: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Result<Json<ServerInfoResponse>, ServerError> {
    let peers = state.hub.peer_count().await?;
    Ok(Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        peers,
        max_peers: state.config.max_peers,
    }))
}

async fn relay_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let max = state.hub.max_peers();
    if max > 0 && state.hub.peer_count().await? >= max {
        return Err(ServerError::RelayFull { max });
    }

    let hub = state.hub.clone();
    let link_buffer = state.config.link_buffer;
    Ok(ws
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| serve_link(socket, hub, link_buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{spawn_hub, RelayHub};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state(max_peers: usize) -> AppState {
        let config = ServerConfig {
            max_peers,
            instance_name: "test relay".into(),
            ..ServerConfig::default()
        };
        AppState {
            hub: spawn_hub(RelayHub::new(max_peers)),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn test_health() {
        let response = build_router(state(0))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_info_reports_peer_count() {
        let response = build_router(state(5))
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["name"], "test relay");
        assert_eq!(info["peers"], 0);
        assert_eq!(info["maxPeers"], 5);
    }

    #[tokio::test]
    async fn test_unknown_path_without_static_dir_is_404() {
        let response = build_router(state(0))
            .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
