//! Logical sessions above sandboxes.
//!
//! A session is a conversation with the agent runtime, distinct from the
//! sandbox it runs in and from any WebSocket attached to it. Sessions are
//! born on first command, persist until explicitly deleted, and journal
//! every event to an append-only ledger.

pub mod event;
mod history;
mod manager;

pub use event::{
    AgentLine, ClientFrame, CommandOptions, HistoryKind, HistoryRecord, ServerFrame, TerminalSize,
    classify_agent_line,
};
pub use history::HistoryLedger;
pub use manager::{SessionHandle, SessionManager};

/// Session-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A command is already in flight for this session
    #[error("a command is already running for this session")]
    Busy,

    /// Unknown or foreign session id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Path escaped the workspace
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Ledger IO failed
    #[error("history error: {0}")]
    History(#[from] std::io::Error),

    /// Session index write failed
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl SessionError {
    /// Stable error kind string used in wire frames and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Busy => "Busy",
            SessionError::SessionNotFound(_) => "SessionNotFound",
            SessionError::PermissionDenied(_) => "PermissionDenied",
            SessionError::History(_) => "IoError",
            SessionError::Store(_) => "StoreError",
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
