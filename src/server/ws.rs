//! Per-connection stream multiplexer.
//!
//! One task per WebSocket. The connection authenticates, acquires the
//! user's sandbox, then loops over a discriminated union of client frames
//! with one match site. Agent output is pumped from the exec stream
//! line-by-line into the session manager, which journals every event and
//! forwards frames to whichever connection is attached at that moment.
//! The outbound channel is bounded; a client that stays stalled past the
//! drain deadline is closed with 1013 while the exec runs on into history.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::AppState;
use crate::container::{ExecSpec, Tier};
use crate::env;
use crate::session::{
    AgentLine, ClientFrame, CommandOptions, HistoryKind, HistoryRecord, ServerFrame,
    SessionHandle, classify_agent_line,
};
use crate::store::UserSettings;

/// Outbound WebSocket buffer; a client must drain it within the deadline.
const OUTBOUND_BUFFER: usize = 256;

/// How long a saturated client gets to drain before the connection closes.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

const CLOSE_AUTH_FAILED: u16 = 1008;
const CLOSE_PROVISION_FAILED: u16 = 1011;
const CLOSE_BACKPRESSURE: u16 = 1013;

#[derive(Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.token))
}

/// Per-connection state shared with the spawned command/shell pumps.
struct Connection {
    state: AppState,
    user_id: i64,
    engine_id: String,
    out_tx: mpsc::Sender<ServerFrame>,
    /// Fired when the client fails the drain deadline
    overflow: CancellationToken,
    /// Fired when the connection goes away
    closed: CancellationToken,
    attached: Mutex<Option<Arc<SessionHandle>>>,
    shell_stdin: Mutex<Option<mpsc::Sender<Bytes>>>,
    shell_exec_id: Mutex<Option<String>>,
}

impl Connection {
    /// Send one frame, applying the backpressure contract: waiting on a
    /// full buffer is the throttle, and blowing the deadline closes the
    /// connection with 1013 and detaches the session. Returns false once
    /// the client is gone; callers keep journaling regardless.
    async fn send_frame(&self, frame: ServerFrame) -> bool {
        if self.overflow.is_cancelled() {
            return false;
        }
        match tokio::time::timeout(DRAIN_DEADLINE, self.out_tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(user_id = self.user_id, "client failed drain deadline");
                self.overflow.cancel();
                if let Some(handle) = self.take_attached() {
                    self.state.sessions.close(&handle);
                }
                false
            }
        }
    }

    fn take_attached(&self) -> Option<Arc<SessionHandle>> {
        lock(&self.attached).take()
    }

    async fn send_error(&self, session_id: Option<String>, kind: &str, message: String) {
        self.send_frame(ServerFrame::ClaudeError {
            session_id,
            error: message,
            kind: kind.to_string(),
        })
        .await;
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, token: Option<String>) {
    // 1. Authenticate; failure closes 1008.
    let claims = match token.as_deref().map(|t| state.tokens.verify(t)) {
        Some(Ok(claims)) => claims,
        _ => {
            close_now(&mut socket, CLOSE_AUTH_FAILED, "Authentication failed").await;
            return;
        }
    };

    // 2. Acquire the sandbox; failure closes 1011 with the error kind.
    let tier = match Tier::parse(&claims.tier) {
        Ok(tier) => tier,
        Err(e) => {
            close_now(&mut socket, CLOSE_PROVISION_FAILED, e.kind()).await;
            return;
        }
    };
    let handle = match state.supervisor.acquire(claims.sub, tier).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(user_id = claims.sub, error = %e, "sandbox acquire failed");
            close_now(&mut socket, CLOSE_PROVISION_FAILED, e.kind()).await;
            return;
        }
    };

    info!(user_id = claims.sub, engine_id = %handle.engine_id, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let overflow = CancellationToken::new();

    // Writer task: the only owner of the socket sink.
    let writer_overflow = overflow.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_overflow.cancelled() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_BACKPRESSURE,
                            reason: "backpressure timeout".into(),
                        })))
                        .await;
                    break;
                }
                next = out_rx.recv() => match next {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "frame serialisation failed");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    let conn = Arc::new(Connection {
        state: state.clone(),
        user_id: claims.sub,
        engine_id: handle.engine_id.clone(),
        out_tx,
        overflow,
        closed: CancellationToken::new(),
        attached: Mutex::new(None),
        shell_stdin: Mutex::new(None),
        shell_exec_id: Mutex::new(None),
    });

    // 3. Ready frame, then the message loop.
    conn.send_frame(ServerFrame::Ready {
        container_id: handle.engine_id.clone(),
    })
    .await;

    // The reader also races the overflow token: a client that stops
    // reading without ever sending a Close frame must still be torn down
    // once the drain deadline fires.
    loop {
        let message = tokio::select! {
            _ = conn.overflow.cancelled() => break,
            message = ws_rx.next() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "unparseable client frame");
                continue;
            }
        };
        dispatch(&conn, frame).await;
    }

    // Closing the socket clears `active` only; a processing command runs to
    // completion with its output journaled.
    conn.closed.cancel();
    if let Some(session) = conn.take_attached() {
        state.sessions.close(&session);
    }
    *lock(&conn.shell_stdin) = None;
    writer.abort();
    info!(user_id = claims.sub, "client disconnected");
}

/// Attach a connection to a session, detaching any previous one, and
/// replay the ledger tail. Session frames reach the connection through the
/// session's outbound sender; the adapter applies the same drain deadline
/// as every other outbound write.
async fn attach_session(conn: &Arc<Connection>, session: &Arc<SessionHandle>) {
    let previous = {
        let mut attached = lock(&conn.attached);
        match &*attached {
            Some(existing) if existing.id() == session.id() => return,
            _ => attached.replace(session.clone()),
        }
    };
    if let Some(previous) = previous {
        conn.state.sessions.close(&previous);
    }

    let (sess_tx, mut sess_rx) = mpsc::channel::<ServerFrame>(32);
    let forward = Arc::clone(conn);
    tokio::spawn(async move {
        while let Some(frame) = sess_rx.recv().await {
            if !forward.send_frame(frame).await {
                break;
            }
        }
    });

    match conn.state.sessions.attach(session, sess_tx) {
        Ok(tail) => {
            let session_id = session.id();
            for record in tail {
                let data = serde_json::to_value(&record).unwrap_or_default();
                if !conn
                    .send_frame(ServerFrame::ClaudeResponse {
                        session_id: session_id.clone(),
                        data,
                    })
                    .await
                {
                    break;
                }
            }
        }
        Err(e) => {
            warn!(user_id = conn.user_id, error = %e, "attach replay failed");
        }
    }
}

/// The single dispatch site for client frames.
async fn dispatch(conn: &Arc<Connection>, frame: ClientFrame) {
    match frame {
        ClientFrame::ClaudeCommand { command, options } => {
            let conn = conn.clone();
            tokio::spawn(async move {
                run_command(conn, command, options).await;
            });
        }
        ClientFrame::Shell { data, resize } => handle_shell(conn, data, resize).await,
        ClientFrame::AbortSession { session_id } => {
            if let Err(e) = conn.state.sessions.abort(conn.user_id, &session_id).await {
                conn.send_error(Some(session_id), e.kind(), e.to_string()).await;
            }
        }
        ClientFrame::Unknown => {
            debug!(user_id = conn.user_id, "ignoring unknown frame type");
        }
    }
}

/// Run one agent command: claim the session's command slot, exec the agent
/// runtime in the sandbox, and pump its stream-json output to the client.
async fn run_command(conn: Arc<Connection>, command: String, options: CommandOptions) {
    let state = &conn.state;

    let layout = state.supervisor.layout();
    let cwd = match layout
        .resolve_client_path(conn.user_id, &options.project_path)
        .and_then(|host| layout.to_container_path(conn.user_id, &host))
    {
        Ok(path) => path.display().to_string(),
        Err(e) => {
            conn.send_error(options.session_id.clone(), "PermissionDenied", e.to_string())
                .await;
            return;
        }
    };

    let session = match state.sessions.start(
        conn.user_id,
        &options.project_path,
        options.session_id.as_deref(),
    ) {
        Ok(session) => session,
        Err(e) => {
            conn.send_error(options.session_id.clone(), e.kind(), e.to_string())
                .await;
            return;
        }
    };
    attach_session(&conn, &session).await;

    let cancel = CancellationToken::new();
    if let Err(e) = state.sessions.begin_command(&session, cancel.clone()) {
        conn.send_error(Some(session.id()), e.kind(), e.to_string()).await;
        return;
    }
    state.supervisor.touch(conn.user_id);

    let _ = state.sessions.ingest_event(
        &session,
        None,
        Some(HistoryRecord::new(
            HistoryKind::User,
            json!({"text": command, "projectPath": options.project_path}),
        )),
    );

    // Settings and MCP config are read through at command start, so edits
    // apply to the next command, never mid-command.
    let settings = state
        .store
        .settings(conn.user_id, "claude")
        .ok()
        .flatten()
        .unwrap_or_default();
    let mcp_servers = state
        .store
        .mcp_servers_for_user(conn.user_id)
        .unwrap_or_default();

    let spec = ExecSpec {
        argv: build_agent_argv(&command, &options, &settings, &mcp_servers, session.id()),
        cwd: Some(cwd),
        env: vec![format!("HOME={}", env::CONTAINER_WORKSPACE)],
        stdin: false,
        tty: false,
    };

    let exec = match state
        .supervisor
        .engine()
        .exec(&conn.engine_id, spec, cancel.clone())
        .await
    {
        Ok(exec) => exec,
        Err(e) => {
            state.sessions.finish_command(&session);
            conn.send_error(Some(session.id()), e.kind(), e.to_string()).await;
            return;
        }
    };

    let _ = state.sessions.ingest_event(
        &session,
        Some(ServerFrame::SessionStart {
            session_id: session.id(),
        }),
        None,
    );

    pump_exec(&conn, &session, exec, cancel).await;
}

/// Translate the exec stream into client frames and ledger records.
async fn pump_exec(
    conn: &Arc<Connection>,
    session: &Arc<SessionHandle>,
    exec: crate::container::ExecStream,
    cancel: CancellationToken,
) {
    let state = &conn.state;
    let crate::container::ExecStream {
        mut output, exit, ..
    } = exec;

    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = output.recv().await {
        buffer.extend_from_slice(&chunk.into_bytes());
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            handle_agent_line(&state.sessions, session, line).await;
        }
    }
    if !buffer.is_empty() {
        let line = String::from_utf8_lossy(&buffer).trim().to_string();
        if !line.is_empty() {
            handle_agent_line(&state.sessions, session, &line).await;
        }
    }

    let exit_code = exit.await.ok().flatten();
    let aborted = cancel.is_cancelled();
    state.sessions.finish_command(session);
    state.supervisor.touch(conn.user_id);

    if aborted {
        // abort() journals the marker and announces session-aborted.
        debug!(session_id = %session.id(), "command aborted");
        return;
    }

    let exit_code = exit_code.unwrap_or(-1);
    if let Err(e) = state.sessions.ingest_event(
        session,
        Some(ServerFrame::ClaudeComplete {
            session_id: session.id(),
            exit_code,
        }),
        Some(HistoryRecord::new(
            HistoryKind::Complete,
            json!({"exitCode": exit_code}),
        )),
    ) {
        warn!(error = %e, "ledger append failed");
    }
}

/// Translate one agent output line into ledger records and session frames.
/// Frames go through the session manager, which forwards to whichever
/// connection is attached right now — not necessarily the one that started
/// the command.
async fn handle_agent_line(
    sessions: &crate::session::SessionManager,
    session: &Arc<SessionHandle>,
    line: &str,
) {
    match classify_agent_line(&session.id(), line) {
        AgentLine::Init { session_id } => {
            if session.id().starts_with("temp-") {
                match sessions.rebind(session, &session_id) {
                    Ok(old_id) => {
                        let _ = sessions.ingest_event(
                            session,
                            Some(ServerFrame::SessionCreated {
                                session_id,
                                temp_session_id: Some(old_id),
                            }),
                            None,
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "session rebind failed");
                    }
                }
            }
        }
        AgentLine::Event { frame, record } => {
            if let Err(e) = sessions.ingest_event(session, Some(frame), record) {
                warn!(error = %e, "ledger append failed");
            }
        }
        AgentLine::Raw(text) => {
            let _ = sessions.ingest_event(
                session,
                Some(ServerFrame::ClaudeOutput {
                    session_id: Some(session.id()),
                    data: text,
                }),
                None,
            );
        }
    }
}

/// Agent runtime invocation. The client-facing model id is mapped by
/// stripping one `claude-` prefix; `custom` passes through for the runtime
/// to accept or reject.
fn build_agent_argv(
    command: &str,
    options: &CommandOptions,
    settings: &UserSettings,
    mcp_servers: &[crate::store::McpServerRecord],
    session_id: String,
) -> Vec<String> {
    let mut argv = vec![
        "claude".to_string(),
        "--print".to_string(),
        "--verbose".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
    ];

    if let Some(model) = options.model.as_deref() {
        let backend_model = model.strip_prefix("claude-").unwrap_or(model);
        argv.push("--model".to_string());
        argv.push(backend_model.to_string());
    }

    if options.resume && !session_id.starts_with("temp-") {
        argv.push("--resume".to_string());
        argv.push(session_id);
    }

    if !settings.allowed_tools.is_empty() {
        argv.push("--allowedTools".to_string());
        argv.push(settings.allowed_tools.join(","));
    }
    if !settings.disallowed_tools.is_empty() {
        argv.push("--disallowedTools".to_string());
        argv.push(settings.disallowed_tools.join(","));
    }
    if settings.skip_permissions {
        argv.push("--dangerously-skip-permissions".to_string());
    }

    let enabled: serde_json::Map<String, serde_json::Value> = mcp_servers
        .iter()
        .filter(|s| s.enabled)
        .map(|s| {
            let mut config = s.config.clone();
            if let Some(obj) = config.as_object_mut() {
                obj.insert("type".to_string(), json!(s.transport));
            }
            (s.name.clone(), config)
        })
        .collect();
    if !enabled.is_empty() {
        argv.push("--mcp-config".to_string());
        argv.push(json!({ "mcpServers": enabled }).to_string());
    }

    argv.push("--".to_string());
    argv.push(command.to_string());
    argv
}

/// Shell frames: the first opens a PTY in the sandbox, later ones carry
/// input bytes or resizes, piped raw in both directions.
async fn handle_shell(
    conn: &Arc<Connection>,
    data: Option<String>,
    resize: Option<crate::session::TerminalSize>,
) {
    let state = &conn.state;

    if let Some(size) = resize {
        let exec_id = lock(&conn.shell_exec_id).clone();
        if let Some(exec_id) = exec_id {
            if let Err(e) = state
                .supervisor
                .engine()
                .resize_exec(&exec_id, size.cols, size.rows)
                .await
            {
                debug!(error = %e, "pty resize failed");
            }
        }
    }

    match data {
        Some(data) => {
            let stdin = lock(&conn.shell_stdin).clone();
            match stdin {
                Some(stdin) => {
                    let _ = stdin.send(Bytes::from(data)).await;
                }
                None => debug!(user_id = conn.user_id, "shell input with no open pty"),
            }
        }
        None => {
            if lock(&conn.shell_stdin).is_some() {
                return;
            }
            open_shell(conn).await;
        }
    }
}

async fn open_shell(conn: &Arc<Connection>) {
    let state = &conn.state;
    let spec = ExecSpec {
        argv: vec!["/bin/bash".to_string(), "-l".to_string()],
        cwd: Some(env::CONTAINER_WORKSPACE.to_string()),
        env: vec![
            format!("HOME={}", env::CONTAINER_WORKSPACE),
            "TERM=xterm-256color".to_string(),
        ],
        stdin: true,
        tty: true,
    };

    let exec = match state
        .supervisor
        .engine()
        .exec(&conn.engine_id, spec, conn.closed.clone())
        .await
    {
        Ok(exec) => exec,
        Err(e) => {
            conn.send_error(None, e.kind(), e.to_string()).await;
            return;
        }
    };

    *lock(&conn.shell_stdin) = Some(exec.stdin.clone());
    *lock(&conn.shell_exec_id) = Some(exec.exec_id.clone());
    state.supervisor.touch(conn.user_id);

    let conn = conn.clone();
    let mut output = exec.output;
    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            let data = String::from_utf8_lossy(&chunk.into_bytes()).into_owned();
            if !conn
                .send_frame(ServerFrame::ClaudeOutput {
                    session_id: None,
                    data,
                })
                .await
            {
                break;
            }
        }
        *lock(&conn.shell_stdin) = None;
        *lock(&conn.shell_exec_id) = None;
        debug!(user_id = conn.user_id, "pty closed");
    });
}

async fn close_now(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(model: Option<&str>) -> CommandOptions {
        CommandOptions {
            session_id: None,
            project_path: "proj".to_string(),
            model: model.map(String::from),
            resume: false,
        }
    }

    #[test]
    fn test_argv_strips_claude_model_prefix() {
        let argv = build_agent_argv(
            "hi",
            &options(Some("claude-sonnet")),
            &UserSettings::default(),
            &[],
            "temp-1".to_string(),
        );
        let model_idx = argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(argv[model_idx + 1], "sonnet");
    }

    #[test]
    fn test_argv_passes_custom_model_through() {
        let argv = build_agent_argv(
            "hi",
            &options(Some("custom")),
            &UserSettings::default(),
            &[],
            "temp-1".to_string(),
        );
        let model_idx = argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(argv[model_idx + 1], "custom");
    }

    #[test]
    fn test_argv_carries_tool_permissions() {
        let settings = UserSettings {
            allowed_tools: vec!["Read".to_string(), "Write".to_string()],
            disallowed_tools: vec!["Bash".to_string()],
            skip_permissions: true,
        };
        let argv = build_agent_argv("hi", &options(None), &settings, &[], "s".to_string());
        let allowed_idx = argv.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(argv[allowed_idx + 1], "Read,Write");
        assert!(argv.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn test_argv_resume_skips_temp_ids() {
        let mut opts = options(None);
        opts.resume = true;
        let argv = build_agent_argv(
            "hi",
            &opts,
            &UserSettings::default(),
            &[],
            "temp-1".to_string(),
        );
        assert!(!argv.contains(&"--resume".to_string()));

        let argv = build_agent_argv(
            "hi",
            &opts,
            &UserSettings::default(),
            &[],
            "9f1c".to_string(),
        );
        let resume_idx = argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(argv[resume_idx + 1], "9f1c");
    }

    #[test]
    fn test_argv_includes_enabled_mcp_servers_only() {
        let servers = vec![
            crate::store::McpServerRecord {
                id: 1,
                user_id: 1,
                name: "files".to_string(),
                transport: "http".to_string(),
                config: json!({"url": "http://localhost:3001"}),
                enabled: true,
            },
            crate::store::McpServerRecord {
                id: 2,
                user_id: 1,
                name: "disabled".to_string(),
                transport: "stdio".to_string(),
                config: json!({"command": "mcp"}),
                enabled: false,
            },
        ];
        let argv = build_agent_argv(
            "hi",
            &options(None),
            &UserSettings::default(),
            &servers,
            "s".to_string(),
        );
        let config_idx = argv.iter().position(|a| a == "--mcp-config").unwrap();
        let config: serde_json::Value = serde_json::from_str(&argv[config_idx + 1]).unwrap();
        assert!(config["mcpServers"]["files"]["url"].is_string());
        assert_eq!(config["mcpServers"]["files"]["type"], "http");
        assert!(config["mcpServers"]["disabled"].is_null());
    }

    #[test]
    fn test_command_is_separated_from_flags() {
        let argv = build_agent_argv(
            "--model evil",
            &options(None),
            &UserSettings::default(),
            &[],
            "s".to_string(),
        );
        let sep_idx = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(argv[sep_idx + 1], "--model evil");
    }
}
