//! Control surface: thin CRUD bindings over the data model.
//!
//! Settings and MCP records are read through on every request so edits take
//! effect on the next command, never mid-command. Error bodies are
//! `{success:false, error:"<kind>", message:"..."}` with the kind mapped to
//! an HTTP status.

use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::{StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::warn;

use super::auth::{self, AuthError, Claims};
use super::AppState;
use crate::container::{ProvisionError, Tier};
use crate::env;
use crate::session::SessionError;
use crate::store::{StoreError, UserSettings};
use crate::workspace::WorkspaceError;

/// Token lifetime issued at login.
const TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Providers the settings surface accepts.
const KNOWN_PROVIDERS: [&str; 1] = ["claude"];

/// Fixed default tool permissions returned by the defaults endpoint.
const DEFAULT_ALLOWED_TOOLS: [&str; 10] = [
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "MultiEdit", "Task", "TodoWrite",
    "SlashCommand",
];

/// An error kind plus human-readable message, rendered as the standard
/// error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    fn from_kind(kind: &'static str, message: String) -> Self {
        Self {
            status: status_for_kind(kind),
            kind,
            message,
        }
    }
}

fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "InvalidCredentials" | "TokenExpired" => StatusCode::UNAUTHORIZED,
        "Forbidden" | "PermissionDenied" => StatusCode::FORBIDDEN,
        "SessionNotFound" | "NotFound" | "FileNotFound" => StatusCode::NOT_FOUND,
        "Busy" | "Conflict" => StatusCode::CONFLICT,
        "PathTraversal" | "InvalidMcpConfig" | "UnknownProvider" | "UnknownTier" => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::from_kind(e.kind(), e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::NotFound(_) => "NotFound",
            StoreError::Conflict(_) => "Conflict",
            _ => "StoreError",
        };
        ApiError::from_kind(kind, e.to_string())
    }
}

impl From<ProvisionError> for ApiError {
    fn from(e: ProvisionError) -> Self {
        ApiError::from_kind(e.kind(), e.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        ApiError::from_kind(e.kind(), e.to_string())
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        ApiError::from_kind(e.kind(), e.to_string())
    }
}

impl FromRequestParts<AppState> for Claims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AuthError::InvalidCredentials)?;
        Ok(state.tokens.verify(token)?)
    }
}

fn require_admin(claims: &Claims) -> Result<(), ApiError> {
    if claims.admin {
        Ok(())
    } else {
        Err(AuthError::Forbidden.into())
    }
}

// --- auth ---------------------------------------------------------------

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub tier: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    #[serde(rename = "containerReady")]
    pub container_ready: bool,
    #[serde(rename = "workspacePath")]
    pub workspace_path: &'static str,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let tier = req.tier.as_deref().unwrap_or("free");
    Tier::parse(tier)?;

    let hash = auth::hash_password(&req.password)?;
    let user = state.store.create_user(&req.username, &hash, tier)?;

    state.supervisor.layout().ensure_layout(user.id)?;
    if let Err(e) = state.supervisor.sync_user_extensions(user.id, false).await {
        warn!(user_id = user.id, error = %e, "initial extension install failed");
    }

    let token = state.tokens.issue(&user, TOKEN_TTL)?;
    Ok(Json(LoginResponse {
        success: true,
        token,
        container_ready: false,
        workspace_path: env::CONTAINER_WORKSPACE,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let user = state
        .store
        .user_by_name(&req.username)
        .map_err(|_| AuthError::InvalidCredentials)?;
    auth::verify_password(&req.password, &user.password_hash)?;

    let token = state.tokens.issue(&user, TOKEN_TTL)?;
    Ok(Json(LoginResponse {
        success: true,
        token,
        container_ready: state.supervisor.is_ready(user.id),
        workspace_path: env::CONTAINER_WORKSPACE,
    }))
}

// --- settings -----------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub struct SettingsBody {
    #[serde(rename = "allowedTools", default)]
    pub allowed_tools: Vec<String>,
    #[serde(rename = "disallowedTools", default)]
    pub disallowed_tools: Vec<String>,
    #[serde(rename = "skipPermissions", default)]
    pub skip_permissions: bool,
}

fn check_provider(provider: &str) -> Result<(), ApiError> {
    if KNOWN_PROVIDERS.contains(&provider) {
        Ok(())
    } else {
        Err(ApiError::from_kind(
            "UnknownProvider",
            format!("unknown provider: {}", provider),
        ))
    }
}

pub async fn get_settings(
    State(state): State<AppState>,
    claims: Claims,
    Path(provider): Path<String>,
) -> Result<Json<SettingsBody>, ApiError> {
    check_provider(&provider)?;
    let settings = state
        .store
        .settings(claims.sub, &provider)?
        .unwrap_or_default();
    Ok(Json(SettingsBody {
        allowed_tools: settings.allowed_tools,
        disallowed_tools: settings.disallowed_tools,
        skip_permissions: settings.skip_permissions,
    }))
}

pub async fn put_settings(
    State(state): State<AppState>,
    claims: Claims,
    Path(provider): Path<String>,
    Json(body): Json<SettingsBody>,
) -> Result<Json<Value>, ApiError> {
    check_provider(&provider)?;
    state.store.put_settings(
        claims.sub,
        &provider,
        &UserSettings {
            allowed_tools: body.allowed_tools,
            disallowed_tools: body.disallowed_tools,
            skip_permissions: body.skip_permissions,
        },
    )?;
    Ok(Json(json!({"success": true})))
}

pub async fn get_settings_defaults(
    _claims: Claims,
    Path(provider): Path<String>,
) -> Result<Json<SettingsBody>, ApiError> {
    check_provider(&provider)?;
    Ok(Json(SettingsBody {
        allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
        disallowed_tools: Vec::new(),
        skip_permissions: false,
    }))
}

// --- MCP servers --------------------------------------------------------

#[derive(Deserialize)]
pub struct McpServerBody {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
pub struct McpServerView {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub transport: String,
    pub config: Value,
    pub enabled: bool,
}

impl From<crate::store::McpServerRecord> for McpServerView {
    fn from(r: crate::store::McpServerRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            transport: r.transport,
            config: r.config,
            enabled: r.enabled,
        }
    }
}

/// Reject records the runtime could never start.
fn validate_mcp(body: &McpServerBody) -> Result<(), ApiError> {
    let invalid = |msg: String| ApiError::from_kind("InvalidMcpConfig", msg);

    if !matches!(body.transport.as_str(), "stdio" | "http" | "sse") {
        return Err(invalid(format!("unknown transport: {}", body.transport)));
    }
    let config = body
        .config
        .as_object()
        .ok_or_else(|| invalid("config must be an object".to_string()))?;

    match body.transport.as_str() {
        "stdio" => {
            let command = config.get("command").and_then(Value::as_str).unwrap_or("");
            if command.is_empty() {
                return Err(invalid("stdio server needs a command".to_string()));
            }
        }
        _ => {
            let url = config.get("url").and_then(Value::as_str).unwrap_or("");
            url::Url::parse(url).map_err(|e| invalid(format!("bad url: {}", e)))?;
        }
    }
    Ok(())
}

pub async fn list_mcp_servers(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Vec<McpServerView>>, ApiError> {
    let records = state.store.mcp_servers_for_user(claims.sub)?;
    Ok(Json(records.into_iter().map(McpServerView::from).collect()))
}

pub async fn create_mcp_server(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<McpServerBody>,
) -> Result<Json<McpServerView>, ApiError> {
    validate_mcp(&body)?;
    let record = state.store.create_mcp_server(
        claims.sub,
        &body.name,
        &body.transport,
        &body.config,
        body.enabled,
    )?;
    Ok(Json(record.into()))
}

pub async fn update_mcp_server(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
    Json(body): Json<McpServerBody>,
) -> Result<Json<McpServerView>, ApiError> {
    validate_mcp(&body)?;
    let record = state.store.update_mcp_server(
        claims.sub,
        id,
        &body.name,
        &body.transport,
        &body.config,
        body.enabled,
    )?;
    Ok(Json(record.into()))
}

pub async fn delete_mcp_server(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_mcp_server(claims.sub, id)?;
    Ok(Json(json!({"success": true})))
}

/// Reachability probe. `http`/`sse` servers get a GET against their URL;
/// `stdio` servers are config-validated only, probing is left to the
/// runtime inside the sandbox.
pub async fn test_mcp_server(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.mcp_server(claims.sub, id)?;

    match record.transport.as_str() {
        "http" | "sse" => {
            let url = record
                .config
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ApiError::from_kind("InvalidMcpConfig", "server has no url".to_string())
                })?;
            let reachable = state
                .probe
                .get(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .is_ok();
            Ok(Json(json!({"success": true, "reachable": reachable})))
        }
        _ => Ok(Json(json!({"success": true, "reachable": Value::Null,
                            "message": "stdio servers are validated, not probed"}))),
    }
}

/// Static tool list from the record's config; live discovery is left to
/// the runtime.
pub async fn mcp_server_tools(
    State(state): State<AppState>,
    claims: Claims,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.mcp_server(claims.sub, id)?;
    let tools = record
        .config
        .get("tools")
        .cloned()
        .unwrap_or_else(|| json!([]));
    Ok(Json(json!({"success": true, "tools": tools})))
}

// --- session history ----------------------------------------------------

#[derive(Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_sessions(
    State(state): State<AppState>,
    claims: Claims,
    Path(project): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let sessions: Vec<Value> = state
        .store
        .sessions_for_user(claims.sub)?
        .into_iter()
        .filter(|s| s.project_path == project)
        .map(|s| {
            json!({
                "id": s.id,
                "projectPath": s.project_path,
                "createdAt": s.created_at,
                "lastMessageAt": s.last_message_at,
            })
        })
        .collect();
    Ok(Json(json!({"success": true, "sessions": sessions})))
}

pub async fn session_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path((project, session_id)): Path<(String, String)>,
    Query(page): Query<PageParams>,
) -> Result<Json<Value>, ApiError> {
    // The project name arrives from the client; reject escapes before it
    // touches the filesystem.
    state
        .supervisor
        .layout()
        .resolve_client_path(claims.sub, &project)?;

    let (records, total) = state.sessions.messages(
        claims.sub,
        &project,
        &session_id,
        page.offset,
        page.limit.min(500),
    )?;
    Ok(Json(json!({
        "success": true,
        "total": total,
        "offset": page.offset,
        "messages": records,
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    claims: Claims,
    Path((_project, session_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state.sessions.delete(claims.sub, &session_id)?;
    Ok(Json(json!({"success": true})))
}

// --- extensions (admin) -------------------------------------------------

#[derive(Deserialize)]
pub struct SyncAllRequest {
    #[serde(rename = "overwriteUserFiles", default)]
    pub overwrite_user_files: bool,
}

#[derive(Deserialize)]
pub struct SyncUserRequest {
    #[serde(rename = "userId")]
    pub user_id: i64,
    #[serde(rename = "overwriteUserFiles", default)]
    pub overwrite_user_files: bool,
}

pub async fn list_extensions(
    State(state): State<AppState>,
    _claims: Claims,
) -> Result<Json<Value>, ApiError> {
    let inventory = state.supervisor.synchroniser().bundle().inventory();
    let body: Value = inventory
        .into_iter()
        .map(|(subtree, names)| (subtree, json!(names)))
        .collect::<serde_json::Map<String, Value>>()
        .into();
    Ok(Json(json!({"success": true, "extensions": body})))
}

pub async fn sync_all_extensions(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<SyncAllRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&claims)?;
    let user_ids = state.store.list_user_ids()?;
    let report = state
        .supervisor
        .sync_all_extensions(&user_ids, req.overwrite_user_files)
        .await;
    Ok(Json(serde_json::to_value(report).unwrap_or_default()))
}

pub async fn sync_user_extensions(
    State(state): State<AppState>,
    claims: Claims,
    Json(req): Json<SyncUserRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&claims)?;
    let copied = state
        .supervisor
        .sync_user_extensions(req.user_id, req.overwrite_user_files)
        .await?;
    Ok(Json(json!({"success": true, "copied": copied})))
}

// --- containers ---------------------------------------------------------

pub async fn container_status(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Value>, ApiError> {
    let entry = state.supervisor.status_for(claims.sub);
    let body = match entry {
        Some(entry) => json!({
            "success": true,
            "status": entry.status.as_str(),
            "containerId": entry.engine_id,
            "tier": entry.tier.as_str(),
            "lastActiveAt": entry.last_active_at,
        }),
        None => json!({"success": true, "status": "absent"}),
    };
    Ok(Json(body))
}

pub async fn container_metrics(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<Json<Value>, ApiError> {
    let entry = state
        .supervisor
        .status_for(claims.sub)
        .ok_or_else(|| ApiError::from_kind("NotFound", "no sandbox".to_string()))?;
    let metrics = state.store.metrics_for(&entry.engine_id, 60)?;
    let body: Vec<Value> = metrics
        .into_iter()
        .map(|m| {
            json!({
                "cpuPercent": m.cpu_percent,
                "memUsed": m.mem_used,
                "memLimit": m.mem_limit,
                "diskUsed": m.disk_used,
                "ts": m.ts,
            })
        })
        .collect();
    Ok(Json(json!({"success": true, "metrics": body})))
}
