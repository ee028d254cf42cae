//! Narrow adapter over the container engine API.
//!
//! The [`Engine`] trait is the only seam through which the rest of the
//! system touches the engine socket; [`BollardEngine`] implements it for
//! Docker/Podman. Transient engine failures are retried here with
//! exponential backoff; "already exists" on the create paths is coerced to
//! success so crash-recovery can latch onto pre-existing sandboxes.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bytes::Bytes;
use futures::stream::StreamExt;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{EngineClient, ProvisionError, Result};
use crate::env;

/// Retry ceiling for transient engine errors.
const MAX_ATTEMPTS: u32 = 4;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Engine-reported container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Running,
    Paused,
    Restarting,
    Stopped,
    Dead,
    NotFound,
}

impl SandboxStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SandboxStatus::Running)
    }
}

/// Fully-specified container creation request. The supervisor owns every
/// field; the driver only translates.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub cmd: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub pids_limit: Option<i64>,
    pub security_opt: Vec<String>,
    pub network_mode: Option<String>,
}

/// Exec request inside a running sandbox.
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<String>,
    pub stdin: bool,
    pub tty: bool,
}

/// One chunk of exec output, tagged by stream.
#[derive(Debug, Clone)]
pub enum ExecChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

impl ExecChunk {
    pub fn into_bytes(self) -> Bytes {
        match self {
            ExecChunk::Stdout(b) | ExecChunk::Stderr(b) => b,
        }
    }
}

/// Duplex handle to a live exec. Output and stdin are bounded channels;
/// suspending the output receiver suspends reads from the engine, which is
/// how backpressure propagates all the way to the container.
pub struct ExecStream {
    pub exec_id: String,
    pub output: mpsc::Receiver<ExecChunk>,
    pub stdin: mpsc::Sender<Bytes>,
    pub exit: oneshot::Receiver<Option<i64>>,
}

/// A container carrying the managed label, as reported by the engine.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub engine_id: String,
    pub name: String,
    pub user_id: Option<i64>,
    pub running: bool,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

/// Engine operations the platform needs. Implemented by [`BollardEngine`]
/// in production and by scripted fakes in tests.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn volume_create(&self, name: &str, host_path: &Path) -> Result<()>;
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;
    async fn start(&self, engine_id: &str) -> Result<()>;
    async fn stop(&self, engine_id: &str, grace: Duration) -> Result<()>;
    async fn remove(&self, engine_id: &str) -> Result<()>;
    async fn inspect(&self, engine_id: &str) -> Result<SandboxStatus>;
    async fn exec(
        &self,
        engine_id: &str,
        spec: ExecSpec,
        cancel: CancellationToken,
    ) -> Result<ExecStream>;
    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<()>;
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;
    async fn stats(&self, engine_id: &str) -> Result<EngineStats>;
}

/// Docker/Podman implementation of [`Engine`].
#[derive(Clone)]
pub struct BollardEngine {
    client: EngineClient,
}

impl BollardEngine {
    pub fn new(client: EngineClient) -> Self {
        Self { client }
    }

    /// Pull the image if it is not present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.image_exists(image).await? {
            debug!("Image {} already exists locally", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(ProvisionError::ImagePullFailure(format!("{}: {}", image, e)));
                }
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Look up a container id by name, for adopt-on-conflict.
    async fn id_by_name(&self, name: &str) -> Result<String> {
        let inspect = self
            .client
            .docker()
            .inspect_container(
                name,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(map_not_found(name))?;
        inspect
            .id
            .ok_or_else(|| ProvisionError::Other(format!("container {} has no id", name)))
    }
}

#[async_trait]
impl Engine for BollardEngine {
    async fn volume_create(&self, name: &str, host_path: &Path) -> Result<()> {
        let host = host_path.display().to_string();
        let result = retry("volume_create", || {
            let mut driver_opts = HashMap::new();
            driver_opts.insert("type", "none");
            driver_opts.insert("o", "bind");
            driver_opts.insert("device", host.as_str());
            let mut labels = HashMap::new();
            labels.insert(env::LABEL_MANAGED, "true");
            self.client
                .docker()
                .create_volume(bollard::volume::CreateVolumeOptions {
                    name,
                    driver: "local",
                    driver_opts,
                    labels,
                })
        })
        .await;

        match result {
            Ok(_) => {
                debug!("Created volume: {}", name);
                Ok(())
            }
            // An existing volume with our name is the crash-recovery path.
            Err(ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            })) => {
                debug!("Volume {} already exists, adopting", name);
                Ok(())
            }
            Err(ProvisionError::Engine(e)) => {
                Err(ProvisionError::VolumeCreateFailure(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            memory: spec.memory_bytes,
            memory_swap: spec.memory_bytes,
            cpu_quota: spec.cpu_quota,
            cpu_period: spec.cpu_period,
            pids_limit: spec.pids_limit,
            security_opt: if spec.security_opt.is_empty() {
                None
            } else {
                Some(spec.security_opt.clone())
            },
            network_mode: spec.network_mode.clone(),
            privileged: Some(false),
            ..Default::default()
        };

        let config = bollard::container::Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.labels.clone()),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let result = retry("create_container", || {
            self.client.docker().create_container(
                Some(bollard::container::CreateContainerOptions {
                    name: spec.name.as_str(),
                    ..Default::default()
                }),
                config.clone(),
            )
        })
        .await;

        match result {
            Ok(response) => {
                info!("Created container: {} ({})", spec.name, response.id);
                Ok(response.id)
            }
            // Name conflict means a previous instance survived a crash;
            // adopt it instead of failing.
            Err(ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                ..
            })) => {
                info!("Container {} already exists, adopting", spec.name);
                self.id_by_name(&spec.name).await
            }
            Err(e) => Err(classify_create_error(e)),
        }
    }

    async fn start(&self, engine_id: &str) -> Result<()> {
        let result = retry("start_container", || {
            self.client.docker().start_container(
                engine_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
        })
        .await;

        match result {
            Ok(()) => {
                info!("Started container: {}", engine_id);
                Ok(())
            }
            // 304: already running.
            Err(ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, engine_id: &str, grace: Duration) -> Result<()> {
        let result = retry("stop_container", || {
            self.client.docker().stop_container(
                engine_id,
                Some(bollard::container::StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
        })
        .await;

        match result {
            Ok(()) => {
                info!("Stopped container: {}", engine_id);
                Ok(())
            }
            // Already stopped / already gone both count as stopped.
            Err(ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, engine_id: &str) -> Result<()> {
        let result = retry("remove_container", || {
            self.client.docker().remove_container(
                engine_id,
                Some(bollard::container::RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
        })
        .await;

        match result {
            Ok(()) => {
                info!("Removed container: {}", engine_id);
                Ok(())
            }
            Err(ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn inspect(&self, engine_id: &str) -> Result<SandboxStatus> {
        let inspect = match self
            .client
            .docker()
            .inspect_container(
                engine_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
        {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(SandboxStatus::NotFound),
            Err(e) => return Err(ProvisionError::Engine(e)),
        };

        let state = match inspect.state {
            Some(state) => state,
            None => return Ok(SandboxStatus::Stopped),
        };

        Ok(if state.running.unwrap_or(false) {
            SandboxStatus::Running
        } else if state.paused.unwrap_or(false) {
            SandboxStatus::Paused
        } else if state.restarting.unwrap_or(false) {
            SandboxStatus::Restarting
        } else if state.dead.unwrap_or(false) {
            SandboxStatus::Dead
        } else {
            SandboxStatus::Stopped
        })
    }

    async fn exec(
        &self,
        engine_id: &str,
        spec: ExecSpec,
        cancel: CancellationToken,
    ) -> Result<ExecStream> {
        debug!("Executing in container {}: {:?}", engine_id, spec.argv);

        let exec = self
            .client
            .docker()
            .create_exec(
                engine_id,
                CreateExecOptions {
                    cmd: Some(spec.argv.clone()),
                    env: if spec.env.is_empty() {
                        None
                    } else {
                        Some(spec.env.clone())
                    },
                    working_dir: spec.cwd.clone(),
                    attach_stdin: Some(spec.stdin),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(spec.tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_not_found(engine_id))?;

        let started = self
            .client
            .docker()
            .start_exec(&exec.id, None)
            .await
            .map_err(ProvisionError::Engine)?;

        let (mut output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(ProvisionError::Other(
                    "unexpected detached execution".to_string(),
                ));
            }
        };

        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(16);
        let (exit_tx, exit_rx) = oneshot::channel();

        // stdin pump; ends when the sender side is dropped.
        tokio::spawn(async move {
            while let Some(buf) = in_rx.recv().await {
                if input.write_all(&buf).await.is_err() {
                    break;
                }
                if input.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output pump. Sending on the bounded channel suspends when the
        // consumer stalls, which stops reads from the engine socket.
        let docker = self.client.docker().clone();
        let exec_id = exec.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("exec {} cancelled", exec_id);
                        break;
                    }
                    item = output.next() => match item {
                        Some(Ok(log)) => {
                            let chunk = match log {
                                bollard::container::LogOutput::StdOut { message } => {
                                    ExecChunk::Stdout(message)
                                }
                                bollard::container::LogOutput::Console { message } => {
                                    ExecChunk::Stdout(message)
                                }
                                bollard::container::LogOutput::StdErr { message } => {
                                    ExecChunk::Stderr(message)
                                }
                                _ => continue,
                            };
                            if out_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("exec {} stream error: {}", exec_id, e);
                            break;
                        }
                        None => break,
                    }
                }
            }

            let exit_code = docker
                .inspect_exec(&exec_id)
                .await
                .ok()
                .and_then(|i| i.exit_code);
            let _ = exit_tx.send(exit_code);
        });

        Ok(ExecStream {
            exec_id: exec.id,
            output: out_rx,
            stdin: in_tx,
            exit: exit_rx,
        })
    }

    async fn resize_exec(&self, exec_id: &str, width: u16, height: u16) -> Result<()> {
        self.client
            .docker()
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height,
                    width,
                },
            )
            .await
            .map_err(map_not_found(exec_id))?;
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", env::LABEL_MANAGED)],
        );

        let containers = retry("list_containers", || {
            self.client
                .docker()
                .list_containers(Some(bollard::container::ListContainersOptions {
                    all: true,
                    filters: filters.clone(),
                    ..Default::default()
                }))
        })
        .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let engine_id = c.id?;
                let user_id = c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(env::LABEL_USER))
                    .and_then(|v| v.parse().ok());
                Some(ManagedContainer {
                    engine_id,
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    user_id,
                    running: c
                        .state
                        .map(|s| s.to_string())
                        .is_some_and(|s| s == "running"),
                })
            })
            .collect())
    }

    async fn stats(&self, engine_id: &str) -> Result<EngineStats> {
        let mut stream = self
            .client
            .docker()
            .stats(engine_id, None::<bollard::container::StatsOptions>);

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(map_not_found(engine_id)(e)),
            None => return Ok(EngineStats::default()),
        };

        let (memory_usage, memory_limit) = stats
            .memory_stats
            .as_ref()
            .map(|mem| (mem.usage.unwrap_or(0), mem.limit.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(EngineStats {
            cpu_percent: calculate_cpu_percent(&stats),
            memory_usage,
            memory_limit,
        })
    }
}

/// CPU usage percentage from a stats sample, engine convention: delta of
/// container CPU time over delta of system CPU time, scaled by online CPUs.
fn calculate_cpu_percent(stats: &bollard::models::ContainerStatsResponse) -> f64 {
    let (cpu_stats, precpu_stats) = match (&stats.cpu_stats, &stats.precpu_stats) {
        (Some(c), Some(p)) => (c, p),
        _ => return 0.0,
    };

    let (cpu_total, precpu_total) = match (
        cpu_stats.cpu_usage.as_ref(),
        precpu_stats.cpu_usage.as_ref(),
    ) {
        (Some(c), Some(p)) => (c.total_usage.unwrap_or(0), p.total_usage.unwrap_or(0)),
        _ => return 0.0,
    };

    let cpu_delta = cpu_total.saturating_sub(precpu_total);
    let system_delta = cpu_stats
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(precpu_stats.system_cpu_usage.unwrap_or(0));
    let online_cpus = cpu_stats.online_cpus.unwrap_or(1) as u64;

    if system_delta > 0 && cpu_delta > 0 {
        (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0
    } else {
        0.0
    }
}

/// Retry a transient-prone engine call with exponential backoff and jitter.
async fn retry<T, F, Fut>(op: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, bollard::errors::Error>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                warn!(
                    "engine op {} failed (attempt {}/{}): {}",
                    op, attempt, MAX_ATTEMPTS, e
                );
                let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) if is_transient(&e) => {
                return Err(ProvisionError::EngineUnreachable(format!("{}: {}", op, e)));
            }
            Err(e) => return Err(ProvisionError::Engine(e)),
        }
    }
}

fn is_transient(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            *status_code >= 500
        }
        bollard::errors::Error::IOError { .. } => true,
        _ => false,
    }
}

fn classify_create_error(err: ProvisionError) -> ProvisionError {
    match err {
        ProvisionError::Engine(bollard::errors::Error::DockerResponseServerError {
            status_code: 507,
            message,
        }) => ProvisionError::ResourceExhausted(message),
        other => other,
    }
}

fn map_not_found(target: &str) -> impl Fn(bollard::errors::Error) -> ProvisionError + '_ {
    move |e| match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => ProvisionError::NotFound(target.to_string()),
        e => ProvisionError::Engine(e),
    }
}
