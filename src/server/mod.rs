//! HTTP control surface and WebSocket stream multiplexer.

pub mod auth;
pub mod http;
pub mod ws;

pub use auth::{AuthError, Claims, TokenIssuer};

use axum::Router;
use axum::routing::{delete, get, post, put};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::container::Supervisor;
use crate::session::SessionManager;
use crate::store::Store;

/// Everything a request handler can reach. Plain values wired at startup;
/// no global registry.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub supervisor: Arc<Supervisor>,
    pub sessions: Arc<SessionManager>,
    pub tokens: Arc<TokenIssuer>,
    /// Shared client for MCP reachability probes
    pub probe: reqwest::Client,
}

/// Assemble the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/register", post(http::register))
        .route("/api/auth/login", post(http::login))
        .route(
            "/api/users/settings/{provider}",
            get(http::get_settings).put(http::put_settings),
        )
        .route(
            "/api/users/settings/{provider}/defaults",
            get(http::get_settings_defaults),
        )
        .route(
            "/api/users/mcp-servers",
            get(http::list_mcp_servers).post(http::create_mcp_server),
        )
        .route(
            "/api/users/mcp-servers/{id}",
            put(http::update_mcp_server).delete(http::delete_mcp_server),
        )
        .route("/api/users/mcp-servers/{id}/test", post(http::test_mcp_server))
        .route("/api/users/mcp-servers/{id}/tools", get(http::mcp_server_tools))
        .route("/api/projects/{name}/sessions", get(http::list_sessions))
        .route(
            "/api/projects/{name}/sessions/{id}/messages",
            get(http::session_messages),
        )
        .route(
            "/api/projects/{name}/sessions/{id}",
            delete(http::delete_session),
        )
        .route("/api/extensions", get(http::list_extensions))
        .route("/api/extensions/sync-all", post(http::sync_all_extensions))
        .route("/api/extensions/sync-user", post(http::sync_user_extensions))
        .route("/api/containers/status", get(http::container_status))
        .route("/api/containers/metrics", get(http::container_metrics))
        .route("/ws", get(ws::ws_upgrade))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.bind_addr;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
