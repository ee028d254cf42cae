//! Session lifecycle scenarios: temp-id rebind, busy semantics, abort
//! markers, and ledger replay across reattachment.

use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use claudehub::session::{HistoryKind, HistoryRecord, ServerFrame, SessionManager};
use claudehub::store::Store;
use claudehub::workspace::WorkspaceLayout;

struct Fixture {
    _root: TempDir,
    manager: Arc<SessionManager>,
    user_id: i64,
}

fn fixture() -> Fixture {
    let root = TempDir::new().unwrap();
    let layout = WorkspaceLayout::new(root.path().to_path_buf());
    let store = Store::open_in_memory().unwrap();
    let user = store.create_user("alice", "hash", "free").unwrap();
    layout.ensure_layout(user.id).unwrap();
    Fixture {
        _root: root,
        manager: Arc::new(SessionManager::new(layout, store)),
        user_id: user.id,
    }
}

#[tokio::test]
async fn command_stream_is_journaled_and_replayed_after_reconnect() {
    let f = fixture();
    let session = f
        .manager
        .start(f.user_id, "my-workspace", Some("temp-1736985600000"))
        .unwrap();

    // First client attaches and a command produces events.
    let (tx, mut rx) = mpsc::channel(16);
    let replay = f.manager.attach(&session, tx).unwrap();
    assert!(replay.is_empty());

    for i in 0..3 {
        f.manager
            .ingest_event(
                &session,
                Some(ServerFrame::ClaudeResponse {
                    session_id: session.id(),
                    data: json!({"i": i}),
                }),
                Some(HistoryRecord::new(HistoryKind::Assistant, json!({"i": i}))),
            )
            .unwrap();
    }
    for _ in 0..3 {
        assert!(rx.recv().await.is_some());
    }

    // Client goes away; the session persists.
    f.manager.close(&session);
    assert!(!session.is_active());

    // A reconnecting client gets the ledger tail.
    let (tx2, _rx2) = mpsc::channel(16);
    let replay = f.manager.attach(&session, tx2).unwrap();
    assert_eq!(replay.len(), 3);
    assert_eq!(replay[2].payload["i"], 2);
}

#[tokio::test]
async fn runtime_assigned_id_replaces_temporary_id() {
    let f = fixture();
    let session = f
        .manager
        .start(f.user_id, "proj", Some("temp-42"))
        .unwrap();
    f.manager
        .ingest_event(
            &session,
            None,
            Some(HistoryRecord::new(HistoryKind::User, json!({"text": "hi"}))),
        )
        .unwrap();

    let old = f.manager.rebind(&session, "c0ffee-uuid").unwrap();
    assert_eq!(old, "temp-42");
    assert_eq!(session.id(), "c0ffee-uuid");

    // History followed the rename and the old id is gone.
    let (records, total) = f
        .manager
        .messages(f.user_id, "proj", "c0ffee-uuid", 0, 10)
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(records[0].kind, HistoryKind::User);
    assert!(f.manager.get(f.user_id, "temp-42").is_err());

    // Resuming by the real id finds the same session.
    let resumed = f
        .manager
        .start(f.user_id, "proj", Some("c0ffee-uuid"))
        .unwrap();
    assert_eq!(resumed.id(), session.id());
}

#[tokio::test]
async fn second_command_is_rejected_while_processing() {
    let f = fixture();
    let session = f.manager.start(f.user_id, "proj", None).unwrap();

    f.manager
        .begin_command(&session, CancellationToken::new())
        .unwrap();
    assert!(session.is_processing());

    let err = f
        .manager
        .begin_command(&session, CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), "Busy");

    f.manager.finish_command(&session);
    assert!(!session.is_processing());
}

#[tokio::test(start_paused = true)]
async fn abort_cancels_and_leaves_a_marker_after_prior_events() {
    let f = fixture();
    let session = f.manager.start(f.user_id, "proj", Some("temp-7")).unwrap();
    let token = CancellationToken::new();
    f.manager.begin_command(&session, token.clone()).unwrap();

    f.manager
        .ingest_event(
            &session,
            None,
            Some(HistoryRecord::new(HistoryKind::Assistant, json!({"n": 1}))),
        )
        .unwrap();

    f.manager.abort(f.user_id, "temp-7").await.unwrap();
    assert!(token.is_cancelled());
    assert!(!session.is_processing());

    // History holds exactly the prior events plus the aborted marker.
    let (records, _) = f.manager.messages(f.user_id, "proj", "temp-7", 0, 10).unwrap();
    let kinds: Vec<HistoryKind> = records.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![HistoryKind::Assistant, HistoryKind::Aborted]);
}

#[tokio::test]
async fn deleting_a_session_removes_index_and_ledger() {
    let f = fixture();
    let session = f.manager.start(f.user_id, "proj", Some("temp-9")).unwrap();
    f.manager
        .ingest_event(
            &session,
            None,
            Some(HistoryRecord::new(HistoryKind::User, json!({"text": "x"}))),
        )
        .unwrap();

    f.manager.delete(f.user_id, "temp-9").unwrap();
    assert!(f.manager.get(f.user_id, "temp-9").is_err());
    let (records, total) = f.manager.messages(f.user_id, "proj", "temp-9", 0, 10).unwrap();
    assert!(records.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn sessions_of_other_users_are_invisible() {
    let f = fixture();
    f.manager.start(f.user_id, "proj", Some("temp-3")).unwrap();
    assert!(f.manager.get(f.user_id + 1, "temp-3").is_err());
    assert!(f
        .manager
        .messages(f.user_id + 1, "proj", "temp-3", 0, 10)
        .is_err());
}
