//! Wire frame and ledger record types.
//!
//! Both directions of the WebSocket protocol are discriminated unions with
//! a single `type` tag, so adding a message type means adding a variant the
//! compiler then demands be handled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent to the browser client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Connection established and sandbox running
    #[serde(rename = "ready")]
    Ready {
        #[serde(rename = "containerId")]
        container_id: String,
    },

    #[serde(rename = "session-start")]
    SessionStart {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// The agent runtime assigned a real session id
    #[serde(rename = "session-created")]
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "tempSessionId", skip_serializing_if = "Option::is_none")]
        temp_session_id: Option<String>,
    },

    #[serde(rename = "token-budget")]
    TokenBudget {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Value,
    },

    #[serde(rename = "TodoWrite")]
    TodoWrite {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Value,
    },

    /// Structured agent event, forwarded as-is
    #[serde(rename = "claude-response")]
    ClaudeResponse {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Value,
    },

    /// Raw output that did not parse as an event line
    #[serde(rename = "claude-output")]
    ClaudeOutput {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        data: String,
    },

    #[serde(rename = "claude-interactive-prompt")]
    InteractivePrompt {
        #[serde(rename = "sessionId")]
        session_id: String,
        data: Value,
    },

    #[serde(rename = "claude-error")]
    ClaudeError {
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: String,
        kind: String,
    },

    #[serde(rename = "claude-complete")]
    ClaudeComplete {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "exitCode")]
        exit_code: i64,
    },

    #[serde(rename = "session-aborted")]
    SessionAborted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    #[serde(rename = "projects_updated")]
    ProjectsUpdated,
}

/// Terminal geometry for PTY resizes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

/// Options carried by a `claude-command` frame.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CommandOptions {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    #[serde(rename = "projectPath", default)]
    pub project_path: String,
    pub model: Option<String>,
    #[serde(default)]
    pub resume: bool,
}

/// Frames received from the browser client.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "claude-command")]
    ClaudeCommand {
        command: String,
        #[serde(default)]
        options: CommandOptions,
    },

    /// First frame opens a PTY; subsequent frames carry input or resizes
    #[serde(rename = "shell")]
    Shell {
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        resize: Option<TerminalSize>,
    },

    #[serde(rename = "abort-session")]
    AbortSession {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Unknown types are ignored with a single log line
    #[serde(other)]
    Unknown,
}

/// Ledger record kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    Thinking,
    TokenBudget,
    Error,
    Complete,
    Aborted,
}

/// One line of the per-session JSONL ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub ts: DateTime<Utc>,
    pub kind: HistoryKind,
    pub payload: Value,
}

impl HistoryRecord {
    pub fn new(kind: HistoryKind, payload: Value) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            payload,
        }
    }
}

/// Classification of one stdout line from the agent runtime.
#[derive(Debug)]
pub enum AgentLine {
    /// Runtime init event carrying its assigned session id
    Init { session_id: String },
    /// An event to forward, with its ledger record when journal-worthy
    Event {
        frame: ServerFrame,
        record: Option<HistoryRecord>,
    },
    /// Not JSON; forwarded raw
    Raw(String),
}

/// Interpret one line of the runtime's stream-json output.
///
/// The taxonomy here is forwarding, not semantics: structured events are
/// re-emitted with the session id attached, interesting kinds are also
/// journaled, and anything unparseable flows through as raw output.
pub fn classify_agent_line(session_id: &str, line: &str) -> AgentLine {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => return AgentLine::Raw(line.to_string()),
    };

    let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "system" => {
            let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
            if subtype == "init" {
                if let Some(real_id) = value.get("session_id").and_then(Value::as_str) {
                    return AgentLine::Init {
                        session_id: real_id.to_string(),
                    };
                }
            }
            AgentLine::Event {
                frame: ServerFrame::ClaudeResponse {
                    session_id: session_id.to_string(),
                    data: value,
                },
                record: None,
            }
        }
        "assistant" => {
            let record = Some(HistoryRecord::new(HistoryKind::Assistant, value.clone()));
            // TodoWrite tool calls get their own frame so the UI can render
            // the task list without digging through message content.
            if let Some(todo) = extract_tool_use(&value, "TodoWrite") {
                return AgentLine::Event {
                    frame: ServerFrame::TodoWrite {
                        session_id: session_id.to_string(),
                        data: todo,
                    },
                    record,
                };
            }
            AgentLine::Event {
                frame: ServerFrame::ClaudeResponse {
                    session_id: session_id.to_string(),
                    data: value,
                },
                record,
            }
        }
        "user" => AgentLine::Event {
            frame: ServerFrame::ClaudeResponse {
                session_id: session_id.to_string(),
                data: value.clone(),
            },
            record: Some(HistoryRecord::new(HistoryKind::ToolResult, value)),
        },
        "result" => {
            let usage = value.get("usage").cloned().unwrap_or(Value::Null);
            AgentLine::Event {
                frame: ServerFrame::TokenBudget {
                    session_id: session_id.to_string(),
                    data: usage,
                },
                record: Some(HistoryRecord::new(HistoryKind::TokenBudget, value)),
            }
        }
        "control_request" => AgentLine::Event {
            frame: ServerFrame::InteractivePrompt {
                session_id: session_id.to_string(),
                data: value,
            },
            record: None,
        },
        _ => AgentLine::Event {
            frame: ServerFrame::ClaudeResponse {
                session_id: session_id.to_string(),
                data: value,
            },
            record: None,
        },
    }
}

/// Pull the input of a named tool_use block out of an assistant message.
fn extract_tool_use(event: &Value, tool_name: &str) -> Option<Value> {
    let content = event.get("message")?.get("content")?.as_array()?;
    content.iter().find_map(|block| {
        if block.get("type")?.as_str()? == "tool_use"
            && block.get("name")?.as_str()? == tool_name
        {
            block.get("input").cloned()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_dispatch() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"claude-command","command":"list files",
                "options":{"projectPath":"my-workspace","model":"sonnet",
                           "sessionId":"temp-1736985600000"}}"#,
        )
        .unwrap();
        match frame {
            ClientFrame::ClaudeCommand { command, options } => {
                assert_eq!(command, "list files");
                assert_eq!(options.project_path, "my-workspace");
                assert_eq!(options.session_id.as_deref(), Some("temp-1736985600000"));
                assert!(!options.resume);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_client_frame_is_tolerated() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"telemetry","blob":42}"#).unwrap();
        assert_eq!(frame, ClientFrame::Unknown);
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let json = serde_json::to_value(ServerFrame::Ready {
            container_id: "abc123".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "ready");
        assert_eq!(json["containerId"], "abc123");

        let json = serde_json::to_value(ServerFrame::ClaudeComplete {
            session_id: "s1".to_string(),
            exit_code: 0,
        })
        .unwrap();
        assert_eq!(json["type"], "claude-complete");
        assert_eq!(json["exitCode"], 0);
    }

    #[test]
    fn test_init_line_carries_session_id() {
        let line = r#"{"type":"system","subtype":"init","session_id":"9f1c2d"}"#;
        match classify_agent_line("temp-1", line) {
            AgentLine::Init { session_id } => assert_eq!(session_id, "9f1c2d"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_assistant_line_is_journaled() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#;
        match classify_agent_line("s1", line) {
            AgentLine::Event { frame, record } => {
                assert!(matches!(frame, ServerFrame::ClaudeResponse { .. }));
                assert_eq!(record.unwrap().kind, HistoryKind::Assistant);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_todo_write_gets_its_own_frame() {
        let line = r#"{"type":"assistant","message":{"content":[
            {"type":"tool_use","name":"TodoWrite","input":{"todos":[]}}]}}"#;
        match classify_agent_line("s1", line) {
            AgentLine::Event { frame, .. } => {
                assert!(matches!(frame, ServerFrame::TodoWrite { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_non_json_line_is_raw() {
        match classify_agent_line("s1", "plain text output") {
            AgentLine::Raw(text) => assert_eq!(text, "plain text output"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
