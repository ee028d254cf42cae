//! Supervisor state-machine tests over a scripted fake engine.
//!
//! The fake honours the driver contract the supervisor relies on:
//! create-with-existing-name adopts, stop/remove on a missing target
//! succeed, inspect reports `NotFound` once a container is gone.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::container::supervisor::SandboxState;
use crate::container::{
    Engine, EngineStats, ExecSpec, ExecStream, ManagedContainer, ProvisionError, Result,
    SandboxSpec, SandboxStatus, Supervisor, SupervisorConfig, Tier,
};
use crate::store::Store;
use crate::workspace::{ExtensionBundle, ExtensionSynchroniser, WorkspaceLayout};

#[derive(Clone)]
struct FakeContainer {
    name: String,
    user_id: Option<i64>,
    running: bool,
}

#[derive(Default)]
struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    volumes: Mutex<Vec<String>>,
    next_id: AtomicU64,
    /// When false, started containers never report running
    start_succeeds: AtomicBool,
}

impl FakeEngine {
    fn new() -> Arc<Self> {
        let engine = Self::default();
        engine.start_succeeds.store(true, Ordering::SeqCst);
        Arc::new(engine)
    }

    fn seed_container(&self, name: &str, user_id: Option<i64>, running: bool) -> String {
        let id = format!("seeded-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                user_id,
                running,
            },
        );
        id
    }

    fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Engine for FakeEngine {
    async fn volume_create(&self, name: &str, _host_path: &Path) -> Result<()> {
        self.volumes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let mut containers = self.containers.lock().unwrap();
        // Driver contract: an existing container with our name is adopted.
        if let Some((id, _)) = containers.iter().find(|(_, c)| c.name == spec.name) {
            return Ok(id.clone());
        }
        let id = format!("engine-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                user_id: spec
                    .labels
                    .get(crate::env::LABEL_USER)
                    .and_then(|v| v.parse().ok()),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, engine_id: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        match containers.get_mut(engine_id) {
            Some(container) => {
                container.running = self.start_succeeds.load(Ordering::SeqCst);
                Ok(())
            }
            None => Err(ProvisionError::NotFound(engine_id.to_string())),
        }
    }

    async fn stop(&self, engine_id: &str, _grace: Duration) -> Result<()> {
        if let Some(container) = self.containers.lock().unwrap().get_mut(engine_id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, engine_id: &str) -> Result<()> {
        self.containers.lock().unwrap().remove(engine_id);
        Ok(())
    }

    async fn inspect(&self, engine_id: &str) -> Result<SandboxStatus> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .get(engine_id)
            .map(|c| {
                if c.running {
                    SandboxStatus::Running
                } else {
                    SandboxStatus::Stopped
                }
            })
            .unwrap_or(SandboxStatus::NotFound))
    }

    async fn exec(
        &self,
        _engine_id: &str,
        _spec: ExecSpec,
        _cancel: CancellationToken,
    ) -> Result<ExecStream> {
        let (_out_tx, output) = tokio::sync::mpsc::channel(1);
        let (stdin, _in_rx) = tokio::sync::mpsc::channel(1);
        let (exit_tx, exit) = tokio::sync::oneshot::channel();
        let _ = exit_tx.send(Some(0));
        Ok(ExecStream {
            exec_id: "fake-exec".to_string(),
            output,
            stdin,
            exit,
        })
    }

    async fn resize_exec(&self, _exec_id: &str, _width: u16, _height: u16) -> Result<()> {
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, c)| ManagedContainer {
                engine_id: id.clone(),
                name: c.name.clone(),
                user_id: c.user_id,
                running: c.running,
            })
            .collect())
    }

    async fn stats(&self, _engine_id: &str) -> Result<EngineStats> {
        Ok(EngineStats {
            cpu_percent: 5.0,
            memory_usage: 256,
            memory_limit: 1024,
        })
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    engine: Arc<FakeEngine>,
    supervisor: Arc<Supervisor>,
    store: Store,
    user_id: i64,
    workspace: PathBuf,
}

fn fixture() -> Fixture {
    let root = tempfile::TempDir::new().unwrap();
    let workspace = root.path().join("workspace");

    let bundle_dir = root.path().join("extensions/.claude");
    std::fs::create_dir_all(bundle_dir.join("commands")).unwrap();
    std::fs::write(bundle_dir.join("commands/deploy.md"), "# deploy").unwrap();

    let layout = WorkspaceLayout::new(workspace.clone());
    let synchroniser =
        ExtensionSynchroniser::new(ExtensionBundle::new(bundle_dir), layout.clone());
    let store = Store::open_in_memory().unwrap();
    let user = store.create_user("alice", "hash", "free").unwrap();

    let engine = FakeEngine::new();
    let config = SupervisorConfig {
        image: "sandbox:test".to_string(),
        readiness_timeout: Duration::from_millis(250),
        readiness_poll: Duration::from_millis(20),
        stop_grace: Duration::from_millis(10),
        sweep_interval: Duration::from_secs(300),
        metrics_max_age: Duration::from_secs(3600),
        seccomp_profile: None,
    };
    let supervisor = Arc::new(Supervisor::new(
        engine.clone(),
        layout,
        synchroniser,
        store.clone(),
        config,
    ));

    Fixture {
        _root: root,
        engine,
        supervisor,
        store,
        user_id: user.id,
        workspace,
    }
}

#[tokio::test]
async fn test_first_acquire_provisions_everything() {
    let f = fixture();
    let handle = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();

    // Workspace tree and extension bundle are in place.
    let claude = crate::env::claude_dir(&f.workspace, f.user_id);
    assert!(claude.join("sessions").is_dir());
    assert!(claude.join("commands/deploy.md").is_file());

    // Engine sees a running container with the contractual name.
    assert_eq!(
        f.engine.inspect(&handle.engine_id).await.unwrap(),
        SandboxStatus::Running
    );
    assert_eq!(f.engine.volumes.lock().unwrap().len(), 1);

    // Registry and persisted record agree.
    let entry = f.supervisor.status_for(f.user_id).unwrap();
    assert_eq!(entry.status, SandboxState::Running);
    let record = f.store.sandbox_by_user(f.user_id).unwrap().unwrap();
    assert_eq!(record.status, "running");
    assert_eq!(record.engine_id.as_deref(), Some(handle.engine_id.as_str()));
    assert_eq!(record.name, format!("claude-user-{}", f.user_id));
    assert_eq!(record.tier_snapshot, "free");
}

#[tokio::test]
async fn test_repeat_acquire_reuses_running_sandbox() {
    let f = fixture();
    let first = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    let second = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert_eq!(first.engine_id, second.engine_id);
    assert_eq!(f.engine.container_count(), 1);
}

#[tokio::test]
async fn test_readiness_timeout_marks_failed_then_recovers() {
    let f = fixture();
    f.engine.start_succeeds.store(false, Ordering::SeqCst);

    let err = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ReadinessTimeout(_)));
    assert_eq!(err.kind(), "ReadinessTimeout");
    assert_eq!(
        f.supervisor.status_for(f.user_id).unwrap().status,
        SandboxState::Failed
    );
    assert_eq!(
        f.store.sandbox_by_user(f.user_id).unwrap().unwrap().status,
        "failed"
    );

    // Engine heals; the next acquire retries from scratch.
    f.engine.start_succeeds.store(true, Ordering::SeqCst);
    let handle = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert_eq!(
        f.engine.inspect(&handle.engine_id).await.unwrap(),
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn test_name_collision_is_adopted_not_rejected() {
    let f = fixture();
    let name = crate::env::container_name(f.user_id);
    let seeded = f.engine.seed_container(&name, Some(f.user_id), false);

    let handle = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert_eq!(handle.engine_id, seeded);
    assert_eq!(f.engine.container_count(), 1);
    assert_eq!(
        f.engine.inspect(&seeded).await.unwrap(),
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn test_release_and_reacquire_preserves_data() {
    let f = fixture();
    let first = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();

    let marker = crate::env::user_data_dir(&f.workspace, f.user_id).join("notes.txt");
    std::fs::write(&marker, "keep me").unwrap();

    f.supervisor.release(f.user_id).await.unwrap();
    assert!(f.supervisor.status_for(f.user_id).is_none());
    assert_eq!(
        f.engine.inspect(&first.engine_id).await.unwrap(),
        SandboxStatus::NotFound
    );
    assert_eq!(
        f.store.sandbox_by_user(f.user_id).unwrap().unwrap().status,
        "removed"
    );

    let second = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert_ne!(first.engine_id, second.engine_id);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "keep me");
}

#[tokio::test]
async fn test_idle_sweep_evicts_only_inactive_users() {
    let f = fixture();
    let handle = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    f.supervisor
        .backdate_activity(f.user_id, Utc::now() - ChronoDuration::minutes(31));

    // A live client attachment shields the sandbox.
    let shielded: crate::container::supervisor::ActiveProbe = Arc::new(|_| true);
    f.supervisor.sweep_once(&shielded).await;
    assert!(f.supervisor.status_for(f.user_id).is_some());

    let unshielded: crate::container::supervisor::ActiveProbe = Arc::new(|_| false);
    f.supervisor.sweep_once(&unshielded).await;
    assert!(f.supervisor.status_for(f.user_id).is_none());
    assert_eq!(
        f.engine.inspect(&handle.engine_id).await.unwrap(),
        SandboxStatus::NotFound
    );
    // The data directory survives eviction.
    assert!(crate::env::claude_dir(&f.workspace, f.user_id).is_dir());
}

#[tokio::test]
async fn test_sweep_samples_metrics_for_running_sandboxes() {
    let f = fixture();
    let handle = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();

    let probe: crate::container::supervisor::ActiveProbe = Arc::new(|_| true);
    f.supervisor.sweep_once(&probe).await;

    let metrics = f.store.metrics_for(&handle.engine_id, 10).unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].mem_limit, 1024);
}

#[tokio::test]
async fn test_reconcile_adopts_survivors_and_removes_orphans() {
    let f = fixture();

    // A survivor from a previous process: record + engine container.
    let name = crate::env::container_name(f.user_id);
    let survivor = f.engine.seed_container(&name, Some(f.user_id), true);
    f.store
        .upsert_sandbox(&crate::store::SandboxRecord {
            user_id: f.user_id,
            engine_id: Some(survivor.clone()),
            name,
            status: "running".to_string(),
            tier_snapshot: "free".to_string(),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        })
        .unwrap();

    // An orphan container with no record behind it.
    let orphan = f
        .engine
        .seed_container("claude-user-999", Some(999), true);

    f.supervisor.reconcile().await.unwrap();

    let entry = f.supervisor.status_for(f.user_id).unwrap();
    assert_eq!(entry.engine_id, survivor);
    assert_eq!(entry.status, SandboxState::Running);
    assert_eq!(
        f.engine.inspect(&orphan).await.unwrap(),
        SandboxStatus::NotFound
    );
}

#[tokio::test]
async fn test_reconcile_evicts_engine_absent_records() {
    let f = fixture();
    f.store
        .upsert_sandbox(&crate::store::SandboxRecord {
            user_id: f.user_id,
            engine_id: Some("long-gone".to_string()),
            name: crate::env::container_name(f.user_id),
            status: "running".to_string(),
            tier_snapshot: "free".to_string(),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        })
        .unwrap();

    f.supervisor.reconcile().await.unwrap();
    assert_eq!(
        f.store.sandbox_by_user(f.user_id).unwrap().unwrap().status,
        "removed"
    );
}

#[tokio::test]
async fn test_stale_entry_reprovisions_after_external_removal() {
    let f = fixture();
    let first = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();

    // Someone removed the container behind our back.
    f.engine.remove(&first.engine_id).await.unwrap();

    let second = f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert_ne!(first.engine_id, second.engine_id);
    assert_eq!(
        f.engine.inspect(&second.engine_id).await.unwrap(),
        SandboxStatus::Running
    );
}

#[tokio::test]
async fn test_extension_sync_runs_once_until_bundle_advances() {
    let f = fixture();
    f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();

    // Delete the installed copy, reacquire: no re-sync, file stays gone.
    let installed = crate::env::claude_dir(&f.workspace, f.user_id).join("commands/deploy.md");
    std::fs::remove_file(&installed).unwrap();
    f.supervisor.release(f.user_id).await.unwrap();
    f.supervisor.acquire(f.user_id, Tier::Free).await.unwrap();
    assert!(!installed.exists());
}
