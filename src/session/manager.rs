//! Session lifecycle and the session map.
//!
//! The manager exclusively owns session mutation. Handles hand out
//! borrow-style access to the multiplexer: a connection may attach, read
//! flags and forward frames, but every state change goes through a manager
//! method. At most one command is in flight per session; a second command
//! while `processing` is refused with `Busy`.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{HistoryKind, HistoryRecord, ServerFrame};
use super::history::HistoryLedger;
use super::{Result, SessionError};
use crate::env;
use crate::store::{SessionRecord, Store};
use crate::workspace::WorkspaceLayout;

/// How long an abort waits for the exec to wind down before the session is
/// reported aborted regardless.
const ABORT_GRACE: Duration = Duration::from_secs(2);
const ABORT_POLL: Duration = Duration::from_millis(50);

/// Records replayed to a client on reattach.
const REPLAY_TAIL: usize = 50;

#[derive(Debug)]
struct SessionState {
    id: String,
    project_path: String,
}

/// One logical conversation. Shared between the manager and at most one
/// attached multiplexer connection.
#[derive(Debug)]
pub struct SessionHandle {
    pub user_id: i64,
    state: RwLock<SessionState>,
    processing: AtomicBool,
    active: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    outbound: Mutex<Option<mpsc::Sender<ServerFrame>>>,
    ledger: Mutex<HistoryLedger>,
}

impl SessionHandle {
    pub fn id(&self) -> String {
        read_lock(&self.state).id.clone()
    }

    pub fn project_path(&self) -> String {
        read_lock(&self.state).project_path.clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Claim the single command slot; false if one is already in flight.
    fn try_begin_processing(&self, cancel: CancellationToken) -> bool {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *lock(&self.cancel) = Some(cancel);
        true
    }

    fn end_processing(&self) {
        self.processing.store(false, Ordering::SeqCst);
        *lock(&self.cancel) = None;
    }

    fn outbound_sender(&self) -> Option<mpsc::Sender<ServerFrame>> {
        lock(&self.outbound).clone()
    }
}

/// The session map and every operation that mutates a session.
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionHandle>>,
    layout: WorkspaceLayout,
    store: Store,
}

impl SessionManager {
    pub fn new(layout: WorkspaceLayout, store: Store) -> Self {
        Self {
            sessions: DashMap::new(),
            layout,
            store,
        }
    }

    /// Obtain the session for a command: resume an existing one, revive an
    /// indexed one, or start a new one under a temporary id.
    pub fn start(
        &self,
        user_id: i64,
        project_path: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<SessionHandle>> {
        if let Some(id) = session_id {
            if let Some(handle) = self.sessions.get(id) {
                let handle = handle.clone();
                if handle.user_id != user_id {
                    return Err(SessionError::SessionNotFound(id.to_string()));
                }
                return Ok(handle);
            }
            // Not live in the map: either a known session from the index
            // (server restarted) or a fresh client-minted temporary id.
            if !id.starts_with("temp-") {
                let record = self
                    .store
                    .session_by_id(id)?
                    .filter(|r| r.user_id == user_id)
                    .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
                return self.insert_session(user_id, &record.project_path, id, false);
            }
            return self.insert_session(user_id, project_path, id, true);
        }

        let temp_id = format!("temp-{}", Utc::now().timestamp_millis());
        self.insert_session(user_id, project_path, &temp_id, true)
    }

    fn insert_session(
        &self,
        user_id: i64,
        project_path: &str,
        id: &str,
        index: bool,
    ) -> Result<Arc<SessionHandle>> {
        let claude_dir = self
            .layout
            .host_data_dir(user_id)
            .join(env::CLAUDE_DIR_NAME);
        let ledger = HistoryLedger::open(&claude_dir, project_path, id)?;

        let handle = Arc::new(SessionHandle {
            user_id,
            state: RwLock::new(SessionState {
                id: id.to_string(),
                project_path: project_path.to_string(),
            }),
            processing: AtomicBool::new(false),
            active: AtomicBool::new(false),
            cancel: Mutex::new(None),
            outbound: Mutex::new(None),
            ledger: Mutex::new(ledger),
        });

        if index {
            self.store.upsert_session(&SessionRecord {
                id: id.to_string(),
                user_id,
                project_path: project_path.to_string(),
                created_at: Utc::now(),
                last_message_at: None,
            })?;
        }

        self.sessions.insert(id.to_string(), handle.clone());
        debug!(user_id, session_id = id, "session started");
        Ok(handle)
    }

    /// Look up a live session owned by a user.
    pub fn get(&self, user_id: i64, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(session_id)
            .map(|h| h.clone())
            .filter(|h| h.user_id == user_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    /// Claim the command slot for a session.
    pub fn begin_command(
        &self,
        handle: &Arc<SessionHandle>,
        cancel: CancellationToken,
    ) -> Result<()> {
        if !handle.try_begin_processing(cancel) {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    /// Release the command slot after the exec stream closed.
    pub fn finish_command(&self, handle: &Arc<SessionHandle>) {
        handle.end_processing();
    }

    /// Attach a client connection; returns the replay tail.
    pub fn attach(
        &self,
        handle: &Arc<SessionHandle>,
        sender: mpsc::Sender<ServerFrame>,
    ) -> Result<Vec<HistoryRecord>> {
        *lock(&handle.outbound) = Some(sender);
        handle.active.store(true, Ordering::SeqCst);
        let tail = lock(&handle.ledger).tail(REPLAY_TAIL)?;
        Ok(tail)
    }

    /// Detach the client; the session itself persists.
    pub fn close(&self, handle: &Arc<SessionHandle>) {
        handle.active.store(false, Ordering::SeqCst);
        *lock(&handle.outbound) = None;
        debug!(session_id = %handle.id(), "client detached");
    }

    /// Journal a record and forward a frame to the attached client, if any.
    /// Journaling is unconditional; forwarding is best-effort (a saturated
    /// or gone client never loses history).
    pub fn ingest_event(
        &self,
        handle: &Arc<SessionHandle>,
        frame: Option<ServerFrame>,
        record: Option<HistoryRecord>,
    ) -> Result<()> {
        if let Some(record) = record {
            lock(&handle.ledger).append(&record)?;
            self.store.touch_session(&handle.id())?;
        }
        if let (Some(frame), Some(sender)) = (frame, handle.outbound_sender()) {
            if let Err(e) = sender.try_send(frame) {
                debug!(session_id = %handle.id(), error = %e, "frame not forwarded");
            }
        }
        Ok(())
    }

    /// Rebind a temporary session id to the runtime-assigned one, renaming
    /// the ledger directory and index row. Returns the old id so the
    /// attached multiplexer can announce the rebind in stream order.
    pub fn rebind(&self, handle: &Arc<SessionHandle>, real_id: &str) -> Result<String> {
        let old_id = handle.id();
        if old_id == real_id {
            return Ok(old_id);
        }

        let new_path = self
            .layout
            .session_messages_path(handle.user_id, real_id);
        {
            let mut ledger = lock(&handle.ledger);
            *ledger = ledger.rename_session_dir(new_path)?;
        }
        self.store.rename_session(&old_id, real_id)?;

        write_lock(&handle.state).id = real_id.to_string();
        self.sessions.remove(&old_id);
        self.sessions.insert(real_id.to_string(), handle.clone());

        info!(old_id, real_id, "session id rebound");
        Ok(old_id)
    }

    /// Signal the in-flight exec to terminate, wait up to the grace period,
    /// then clear `processing` regardless of how the exec winds down. The
    /// exec's remaining output is still journaled when it arrives.
    pub async fn abort(&self, user_id: i64, session_id: &str) -> Result<()> {
        let handle = self.get(user_id, session_id)?;

        let cancel = lock(&handle.cancel).clone();
        match cancel {
            Some(token) => token.cancel(),
            None => {
                debug!(session_id, "abort with no command in flight");
                return Ok(());
            }
        }

        let deadline = tokio::time::Instant::now() + ABORT_GRACE;
        while handle.is_processing() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(ABORT_POLL).await;
        }
        if handle.is_processing() {
            warn!(session_id, "exec did not wind down in grace period");
            handle.end_processing();
        }

        self.ingest_event(
            &handle,
            Some(ServerFrame::SessionAborted {
                session_id: handle.id(),
            }),
            Some(HistoryRecord::new(HistoryKind::Aborted, json!({}))),
        )?;
        Ok(())
    }

    /// Delete a session and its ledger.
    pub fn delete(&self, user_id: i64, session_id: &str) -> Result<()> {
        let record = self
            .store
            .session_by_id(session_id)?
            .filter(|r| r.user_id == user_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;

        self.sessions.remove(session_id);
        self.store.delete_session(session_id)?;
        let session_dir = env::session_dir(
            self.layout.workspace_root(),
            record.user_id,
            session_id,
        );
        if session_dir.exists() {
            std::fs::remove_dir_all(&session_dir)?;
        }
        Ok(())
    }

    /// Whether the user has any session with a live client attached. The
    /// supervisor's idle sweeper consults this before evicting.
    pub fn user_has_active_session(&self, user_id: i64) -> bool {
        self.sessions
            .iter()
            .any(|item| item.value().user_id == user_id && item.value().is_active())
    }

    /// Paginated ledger read for the history endpoint.
    pub fn messages(
        &self,
        user_id: i64,
        project_path: &str,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<HistoryRecord>, usize)> {
        // Prefer the live handle; fall back to opening the ledger directly.
        if let Some(handle) = self.sessions.get(session_id) {
            if handle.user_id != user_id {
                return Err(SessionError::SessionNotFound(session_id.to_string()));
            }
            return Ok(lock(&handle.ledger).page(offset, limit)?);
        }

        let claude_dir = self
            .layout
            .host_data_dir(user_id)
            .join(env::CLAUDE_DIR_NAME);
        let ledger = HistoryLedger::open(&claude_dir, project_path, session_id)?;
        Ok(ledger.page(offset, limit)?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, SessionManager, i64) {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("alice", "hash", "free").unwrap();
        layout.ensure_layout(user.id).unwrap();
        (dir, SessionManager::new(layout, store), user.id)
    }

    #[test]
    fn test_start_allocates_temp_id() {
        let (_dir, manager, user) = manager();
        let handle = manager.start(user, "proj", None).unwrap();
        assert!(handle.id().starts_with("temp-"));
        assert!(!handle.is_processing());
    }

    #[test]
    fn test_busy_while_processing() {
        let (_dir, manager, user) = manager();
        let handle = manager.start(user, "proj", None).unwrap();

        manager
            .begin_command(&handle, CancellationToken::new())
            .unwrap();
        let err = manager
            .begin_command(&handle, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SessionError::Busy));
        assert_eq!(err.kind(), "Busy");

        manager.finish_command(&handle);
        manager
            .begin_command(&handle, CancellationToken::new())
            .unwrap();
    }

    #[test]
    fn test_rebind_renames_ledger_and_map_entry() {
        let (_dir, manager, user) = manager();
        let handle = manager.start(user, "proj", Some("temp-123")).unwrap();
        manager
            .ingest_event(
                &handle,
                None,
                Some(HistoryRecord::new(HistoryKind::User, json!({"text": "hi"}))),
            )
            .unwrap();

        manager.rebind(&handle, "9f1c-real").unwrap();
        assert_eq!(handle.id(), "9f1c-real");
        assert!(manager.get(user, "9f1c-real").is_ok());
        assert!(manager.get(user, "temp-123").is_err());

        // Ledger content followed the rename.
        let (records, total) = manager
            .messages(user, "proj", "9f1c-real", 0, 10)
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(records[0].kind, HistoryKind::User);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_clears_processing_and_journals_marker() {
        let (_dir, manager, user) = manager();
        let handle = manager.start(user, "proj", Some("temp-9")).unwrap();
        let token = CancellationToken::new();
        manager.begin_command(&handle, token.clone()).unwrap();

        // No exec is draining the token, so the grace period elapses and
        // processing is force-cleared.
        manager.abort(user, "temp-9").await.unwrap();
        assert!(!handle.is_processing());
        assert!(token.is_cancelled());

        let (records, _) = manager.messages(user, "proj", "temp-9", 0, 10).unwrap();
        assert_eq!(records.last().unwrap().kind, HistoryKind::Aborted);
    }

    #[test]
    fn test_foreign_session_is_not_found() {
        let (_dir, manager, user) = manager();
        manager.start(user, "proj", Some("temp-5")).unwrap();
        let err = manager.get(user + 1, "temp-5").unwrap_err();
        assert!(matches!(err, SessionError::SessionNotFound(_)));
    }

    #[test]
    fn test_active_flag_tracks_attachment() {
        let (_dir, manager, user) = manager();
        let handle = manager.start(user, "proj", None).unwrap();
        assert!(!manager.user_has_active_session(user));

        let (tx, _rx) = mpsc::channel(8);
        manager.attach(&handle, tx).unwrap();
        assert!(manager.user_has_active_session(user));

        manager.close(&handle);
        assert!(!manager.user_has_active_session(user));
    }
}
