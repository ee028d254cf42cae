//! Per-user sandbox lifecycle supervision.
//!
//! The supervisor owns the only mutable map of user → sandbox and the only
//! code path that transitions sandbox state. Each user has a lifecycle
//! mutex; all operations for that user run under it while different users
//! proceed in parallel. State transitions:
//!
//! `absent → creating → running → {stopped → running} → removing → removed`
//!
//! with `creating|running|stopped → failed` on unrecoverable driver errors.
//! A `failed` entry is removed on the next acquire, which retries from
//! scratch.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::container::{Engine, ProvisionError, Result, SandboxSpec, Tier};
use crate::env;
use crate::store::{SandboxMetric, SandboxRecord, Store};
use crate::workspace::{ExtensionSynchroniser, WorkspaceLayout};

/// Registry-side sandbox state; `absent` is the lack of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Creating,
    Running,
    Stopped,
    Removing,
    Removed,
    Failed,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Creating => "creating",
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Removing => "removing",
            SandboxState::Removed => "removed",
            SandboxState::Failed => "failed",
        }
    }
}

/// In-memory registry entry for one user's sandbox.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub engine_id: String,
    pub status: SandboxState,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

/// Handle returned by a successful acquire; the sandbox is running.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub user_id: i64,
    pub engine_id: String,
}

/// Supervisor tuning knobs.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Image every sandbox is created from
    pub image: String,
    /// Hard deadline for a sandbox to report running
    pub readiness_timeout: Duration,
    /// Poll cadence while waiting for readiness
    pub readiness_poll: Duration,
    /// Grace given to a container before kill on stop
    pub stop_grace: Duration,
    /// Idle sweeper tick
    pub sweep_interval: Duration,
    /// Metric samples older than this are pruned
    pub metrics_max_age: Duration,
    /// Seccomp profile JSON, applied to every sandbox when present
    pub seccomp_profile: Option<String>,
}

impl SupervisorConfig {
    /// Build from the resolved server configuration, loading the seccomp
    /// profile from the workspace tree when present.
    pub fn from_config(config: &crate::config::Config) -> Self {
        let profile_path = env::seccomp_profile_path(&config.workspace_dir);
        let seccomp_profile = match std::fs::read_to_string(&profile_path) {
            Ok(json) => {
                info!("Loaded seccomp profile: {}", profile_path.display());
                Some(json)
            }
            Err(_) => {
                warn!(
                    "No seccomp profile at {}, using engine default",
                    profile_path.display()
                );
                None
            }
        };

        Self {
            image: config.container_image.clone(),
            readiness_timeout: config.readiness_timeout,
            readiness_poll: Duration::from_millis(500),
            stop_grace: Duration::from_secs(10),
            sweep_interval: config.idle_sweep_interval,
            metrics_max_age: Duration::from_secs(24 * 60 * 60),
            seccomp_profile,
        }
    }
}

struct UserSlot {
    /// Serialises lifecycle operations for one user.
    lifecycle: tokio::sync::Mutex<()>,
    /// Observable state; never held across an await.
    entry: RwLock<Option<RegistryEntry>>,
}

impl UserSlot {
    fn new() -> Self {
        Self {
            lifecycle: tokio::sync::Mutex::new(()),
            entry: RwLock::new(None),
        }
    }

    fn read_entry(&self) -> Option<RegistryEntry> {
        match self.entry.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn write_entry(&self, value: Option<RegistryEntry>) {
        match self.entry.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// Callback the sweeper uses to ask whether a user has a live client
/// attached; wired to the session manager at assembly time.
pub type ActiveProbe = Arc<dyn Fn(i64) -> bool + Send + Sync>;

/// The per-user sandbox state machine.
pub struct Supervisor {
    engine: Arc<dyn Engine>,
    layout: WorkspaceLayout,
    synchroniser: ExtensionSynchroniser,
    store: Store,
    config: SupervisorConfig,
    registry: DashMap<i64, Arc<UserSlot>>,
}

impl Supervisor {
    pub fn new(
        engine: Arc<dyn Engine>,
        layout: WorkspaceLayout,
        synchroniser: ExtensionSynchroniser,
        store: Store,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            engine,
            layout,
            synchroniser,
            store,
            config,
            registry: DashMap::new(),
        }
    }

    pub fn synchroniser(&self) -> &ExtensionSynchroniser {
        &self.synchroniser
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn slot(&self, user_id: i64) -> Arc<UserSlot> {
        self.registry
            .entry(user_id)
            .or_insert_with(|| Arc::new(UserSlot::new()))
            .clone()
    }

    /// Observable registry state for a user, if any.
    pub fn status_for(&self, user_id: i64) -> Option<RegistryEntry> {
        self.registry.get(&user_id).and_then(|slot| slot.read_entry())
    }

    /// Whether the user currently has a running sandbox.
    pub fn is_ready(&self, user_id: i64) -> bool {
        self.status_for(user_id)
            .map(|e| e.status == SandboxState::Running)
            .unwrap_or(false)
    }

    /// Bump the activity clock for a user; called on every command.
    pub fn touch(&self, user_id: i64) {
        if let Some(slot) = self.registry.get(&user_id) {
            if let Some(mut entry) = slot.read_entry() {
                entry.last_active_at = Utc::now();
                slot.write_entry(Some(entry));
            }
        }
        if let Err(e) = self.store.touch_sandbox(user_id) {
            warn!(user_id, error = %e, "failed to persist activity bump");
        }
    }

    /// Ensure the user has a running sandbox and return a handle to it.
    ///
    /// Runs entirely under the user's lifecycle lock. On failure the entry
    /// is marked `failed` and the error surfaced once; the next acquire
    /// retries from scratch.
    pub async fn acquire(&self, user_id: i64, tier: Tier) -> Result<SandboxHandle> {
        let slot = self.slot(user_id);
        let _guard = slot.lifecycle.lock().await;

        // Fast path: verify the live entry against the engine.
        if let Some(entry) = slot.read_entry() {
            if entry.status == SandboxState::Running {
                match self.engine.inspect(&entry.engine_id).await {
                    Ok(status) if status.is_running() => {
                        let mut updated = entry;
                        updated.last_active_at = Utc::now();
                        let engine_id = updated.engine_id.clone();
                        slot.write_entry(Some(updated));
                        self.store.touch_sandbox(user_id)?;
                        return Ok(SandboxHandle { user_id, engine_id });
                    }
                    Ok(_) | Err(ProvisionError::NotFound(_)) => {
                        debug!(user_id, "registry entry stale, reprovisioning");
                    }
                    Err(e) => return Err(e),
                }
            }
            // Anything but a verified running sandbox: drop the entry and
            // fall through to a fresh provision.
            self.cleanup_engine_remnant(&entry.engine_id).await;
            slot.write_entry(None);
        }

        match self.provision(user_id, tier).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(user_id, error = %e, "sandbox provisioning failed");
                self.mark_failed(&slot, user_id, tier);
                Err(e)
            }
        }
    }

    async fn provision(&self, user_id: i64, tier: Tier) -> Result<SandboxHandle> {
        let created_at = Utc::now();
        info!(user_id, tier = %tier, "provisioning sandbox");

        self.layout.ensure_layout(user_id)?;
        self.sync_extensions_if_due(user_id)?;

        self.store.upsert_sandbox(&SandboxRecord {
            user_id,
            engine_id: None,
            name: env::container_name(user_id),
            status: SandboxState::Creating.as_str().to_string(),
            tier_snapshot: tier.as_str().to_string(),
            created_at,
            last_active_at: created_at,
        })?;

        let host_dir = self.layout.host_data_dir(user_id);
        self.engine
            .volume_create(&env::volume_name(user_id), &host_dir)
            .await?;

        let spec = self.build_spec(user_id, tier, &host_dir);
        let engine_id = self.engine.create(&spec).await?;
        self.engine.start(&engine_id).await?;
        self.wait_ready(&engine_id).await?;

        let now = Utc::now();
        self.store.upsert_sandbox(&SandboxRecord {
            user_id,
            engine_id: Some(engine_id.clone()),
            name: spec.name.clone(),
            status: SandboxState::Running.as_str().to_string(),
            tier_snapshot: tier.as_str().to_string(),
            created_at,
            last_active_at: now,
        })?;

        self.slot(user_id).write_entry(Some(RegistryEntry {
            engine_id: engine_id.clone(),
            status: SandboxState::Running,
            tier,
            created_at,
            last_active_at: now,
        }));

        info!(user_id, engine_id = %engine_id, "sandbox ready");
        Ok(SandboxHandle { user_id, engine_id })
    }

    /// Stop and remove a user's sandbox, preserving the data directory.
    pub async fn release(&self, user_id: i64) -> Result<()> {
        let slot = self.slot(user_id);
        let _guard = slot.lifecycle.lock().await;

        let entry = match slot.read_entry() {
            Some(entry) => entry,
            None => return Ok(()),
        };

        info!(user_id, engine_id = %entry.engine_id, "releasing sandbox");
        slot.write_entry(Some(RegistryEntry {
            status: SandboxState::Removing,
            ..entry.clone()
        }));
        self.store
            .set_sandbox_status(user_id, SandboxState::Removing.as_str())?;

        self.engine.stop(&entry.engine_id, self.config.stop_grace).await?;
        self.engine.remove(&entry.engine_id).await?;

        slot.write_entry(None);
        self.store
            .set_sandbox_status(user_id, SandboxState::Removed.as_str())?;
        Ok(())
    }

    /// Align registry and store with engine-reported reality. Idempotent;
    /// run at startup and safe to run at any time.
    pub async fn reconcile(&self) -> Result<()> {
        let managed = self.engine.list_managed().await?;
        let mut seen_users = HashSet::new();

        for container in &managed {
            let user_id = match container.user_id {
                Some(user_id) => user_id,
                None => {
                    warn!(
                        engine_id = %container.engine_id,
                        "managed container without user label, removing"
                    );
                    self.cleanup_engine_remnant(&container.engine_id).await;
                    continue;
                }
            };
            seen_users.insert(user_id);

            let slot = self.slot(user_id);
            let _guard = slot.lifecycle.lock().await;

            let record = self.store.sandbox_by_user(user_id)?;
            match record {
                Some(record) => {
                    let tier = Tier::parse(&record.tier_snapshot)?;
                    let status = if container.running {
                        SandboxState::Running
                    } else {
                        SandboxState::Stopped
                    };
                    info!(
                        user_id,
                        engine_id = %container.engine_id,
                        status = status.as_str(),
                        "adopting surviving sandbox"
                    );
                    slot.write_entry(Some(RegistryEntry {
                        engine_id: container.engine_id.clone(),
                        status,
                        tier,
                        created_at: record.created_at,
                        last_active_at: record.last_active_at,
                    }));
                    self.store.upsert_sandbox(&SandboxRecord {
                        engine_id: Some(container.engine_id.clone()),
                        status: status.as_str().to_string(),
                        ..record
                    })?;
                }
                None => {
                    info!(
                        user_id,
                        engine_id = %container.engine_id,
                        "orphan sandbox without record, removing"
                    );
                    self.cleanup_engine_remnant(&container.engine_id).await;
                }
            }
        }

        // Persisted-but-engine-absent records are marked removed.
        for record in self.store.list_sandboxes()? {
            let live = matches!(record.status.as_str(), "creating" | "running" | "stopped");
            if live && !seen_users.contains(&record.user_id) {
                info!(user_id = record.user_id, "evicting engine-absent record");
                self.store
                    .set_sandbox_status(record.user_id, SandboxState::Removed.as_str())?;
                if let Some(slot) = self.registry.get(&record.user_id) {
                    slot.write_entry(None);
                }
            }
        }

        Ok(())
    }

    /// Spawn the idle sweeper; ticks every `sweep_interval`, evicting idle
    /// sandboxes whose users have no active session and sampling metrics
    /// for the rest.
    pub fn spawn_sweeper(self: Arc<Self>, active_probe: ActiveProbe) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.sweep_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup
            // reconciliation settles first.
            tick.tick().await;
            loop {
                tick.tick().await;
                self.sweep_once(&active_probe).await;
            }
        })
    }

    /// One sweep pass, callable directly from tests.
    pub async fn sweep_once(&self, active_probe: &ActiveProbe) {
        let snapshot: Vec<(i64, RegistryEntry)> = self
            .registry
            .iter()
            .filter_map(|item| item.value().read_entry().map(|e| (*item.key(), e)))
            .collect();

        for (user_id, entry) in snapshot {
            if entry.status != SandboxState::Running {
                continue;
            }

            self.sample_metrics(user_id, &entry).await;

            let idle = Utc::now() - entry.last_active_at;
            let timeout = entry.tier.limits().idle_timeout;
            if idle.to_std().map(|d| d > timeout).unwrap_or(false) && !active_probe(user_id) {
                info!(
                    user_id,
                    idle_secs = idle.num_seconds(),
                    "idle timeout exceeded, evicting sandbox"
                );
                if let Err(e) = self.release(user_id).await {
                    warn!(user_id, error = %e, "idle eviction failed");
                }
            }
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.metrics_max_age)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        if let Err(e) = self.store.prune_metrics(cutoff) {
            warn!(error = %e, "metric pruning failed");
        }
    }

    async fn sample_metrics(&self, user_id: i64, entry: &RegistryEntry) {
        let stats = match self.engine.stats(&entry.engine_id).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(user_id, error = %e, "stats sampling failed");
                return;
            }
        };

        let data_dir = self.layout.host_data_dir(user_id);
        let disk_used = tokio::task::spawn_blocking(move || dir_size(&data_dir))
            .await
            .unwrap_or(0);

        let disk_quota = entry.tier.limits().disk_bytes as u64;
        if disk_used > disk_quota {
            warn!(
                user_id,
                disk_used,
                disk_quota,
                "sandbox data directory exceeds tier disk quota"
            );
        }

        let metric = SandboxMetric {
            engine_id: entry.engine_id.clone(),
            cpu_percent: stats.cpu_percent,
            mem_used: stats.memory_usage,
            mem_limit: stats.memory_limit,
            disk_used,
            ts: Utc::now(),
        };
        if let Err(e) = self.store.insert_metric(&metric) {
            warn!(user_id, error = %e, "metric insert failed");
        }
    }

    fn build_spec(&self, user_id: i64, tier: Tier, host_dir: &Path) -> SandboxSpec {
        let limits = tier.limits();

        let mut labels = std::collections::HashMap::new();
        labels.insert(env::LABEL_USER.to_string(), user_id.to_string());
        labels.insert(env::LABEL_MANAGED.to_string(), "true".to_string());

        let mut security_opt = vec!["no-new-privileges:true".to_string()];
        if let Some(profile) = &self.config.seccomp_profile {
            security_opt.push(format!("seccomp={}", profile));
        }

        SandboxSpec {
            image: self.config.image.clone(),
            name: env::container_name(user_id),
            env: vec![
                format!("USER_ID={}", user_id),
                format!("HOME={}", env::CONTAINER_WORKSPACE),
                "NODE_ENV=production".to_string(),
            ],
            binds: vec![format!(
                "{}:{}:rw",
                host_dir.display(),
                env::CONTAINER_WORKSPACE
            )],
            labels,
            working_dir: Some(env::CONTAINER_WORKSPACE.to_string()),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            memory_bytes: Some(limits.memory_bytes),
            cpu_quota: Some(tier.cpu_quota()),
            cpu_period: Some(tier.cpu_period()),
            pids_limit: Some(limits.pids_limit),
            security_opt,
            network_mode: Some("bridge".to_string()),
        }
    }

    async fn wait_ready(&self, engine_id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;
        loop {
            if self.engine.inspect(engine_id).await?.is_running() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionError::ReadinessTimeout(engine_id.to_string()));
            }
            tokio::time::sleep(self.config.readiness_poll).await;
        }
    }

    /// Admin-triggered bundle push for one user, serialised with that
    /// user's lifecycle operations so a sync never races an acquire.
    pub async fn sync_user_extensions(&self, user_id: i64, overwrite: bool) -> Result<usize> {
        let slot = self.slot(user_id);
        let _guard = slot.lifecycle.lock().await;
        let copied = self.synchroniser.sync_one(user_id, overwrite)?;
        self.store.mark_extensions_synced(user_id, Utc::now())?;
        Ok(copied)
    }

    /// Fan a bundle push over all users; partial success is not an error.
    pub async fn sync_all_extensions(
        &self,
        user_ids: &[i64],
        overwrite: bool,
    ) -> crate::workspace::SyncReport {
        let mut report = crate::workspace::SyncReport {
            total: user_ids.len(),
            ..Default::default()
        };
        for &user_id in user_ids {
            match self.sync_user_extensions(user_id, overwrite).await {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    warn!(user_id, error = %e, "extension push failed");
                    report.failed += 1;
                    report.errors.push(format!("user {}: {}", user_id, e));
                }
            }
        }
        info!(
            total = report.total,
            synced = report.synced,
            failed = report.failed,
            "extension push finished"
        );
        report
    }

    /// Install the extension bundle on first use; afterwards only when the
    /// bundle advanced past the user's last sync.
    fn sync_extensions_if_due(&self, user_id: i64) -> Result<()> {
        let user = self.store.user_by_id(user_id)?;
        let due = match user.extensions_synced_at {
            None => true,
            Some(synced_at) => bundle_mtime(self.synchroniser.bundle().source_dir())
                .map(|mtime| mtime > synced_at)
                .unwrap_or(false),
        };
        if due {
            self.synchroniser.sync_one(user_id, false)?;
            self.store.mark_extensions_synced(user_id, Utc::now())?;
        }
        Ok(())
    }

    fn mark_failed(&self, slot: &UserSlot, user_id: i64, tier: Tier) {
        let entry = slot.read_entry();
        slot.write_entry(Some(RegistryEntry {
            engine_id: entry.map(|e| e.engine_id).unwrap_or_default(),
            status: SandboxState::Failed,
            tier,
            created_at: Utc::now(),
            last_active_at: Utc::now(),
        }));
        if let Err(e) = self
            .store
            .set_sandbox_status(user_id, SandboxState::Failed.as_str())
        {
            warn!(user_id, error = %e, "failed to persist failed status");
        }
    }

    /// Rewind a user's activity clock so idle paths can be exercised
    /// without waiting out a tier timeout.
    #[cfg(test)]
    pub(crate) fn backdate_activity(&self, user_id: i64, at: DateTime<Utc>) {
        if let Some(slot) = self.registry.get(&user_id) {
            if let Some(mut entry) = slot.read_entry() {
                entry.last_active_at = at;
                slot.write_entry(Some(entry));
            }
        }
    }

    /// Best-effort removal of an engine-side remnant; errors are logged,
    /// not surfaced, because the next provision supersedes it anyway.
    async fn cleanup_engine_remnant(&self, engine_id: &str) {
        if engine_id.is_empty() {
            return;
        }
        if let Err(e) = self.engine.stop(engine_id, Duration::from_secs(2)).await {
            debug!(engine_id, error = %e, "remnant stop failed");
        }
        if let Err(e) = self.engine.remove(engine_id).await {
            debug!(engine_id, error = %e, "remnant remove failed");
        }
    }
}

/// Recursive directory size in bytes; symlinks are not followed.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            total += dir_size(&entry.path());
        } else if metadata.is_file() {
            total += metadata.len();
        }
    }
    total
}

/// Modification time of the newest top-level entry in the bundle,
/// as the bundle's implicit version counter.
fn bundle_mtime(dir: &Path) -> Option<DateTime<Utc>> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut newest: Option<std::time::SystemTime> = None;
    for entry in entries.flatten() {
        if let Ok(metadata) = entry.metadata() {
            if let Ok(mtime) = metadata.modified() {
                newest = Some(match newest {
                    Some(current) if current >= mtime => current,
                    _ => mtime,
                });
            }
        }
    }
    newest.map(DateTime::<Utc>::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings_match_contract() {
        for (state, s) in [
            (SandboxState::Creating, "creating"),
            (SandboxState::Running, "running"),
            (SandboxState::Stopped, "stopped"),
            (SandboxState::Removing, "removing"),
            (SandboxState::Removed, "removed"),
            (SandboxState::Failed, "failed"),
        ] {
            assert_eq!(state.as_str(), s);
        }
    }

    #[test]
    fn test_dir_size_counts_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()), 150);
    }
}
