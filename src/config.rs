//! Server configuration loading.
//!
//! Configuration is assembled from an optional TOML file overridden by
//! environment variables:
//!
//! 1. `--config <path>` or `./claudehub.toml`
//! 2. Environment: `WORKSPACE_DIR`, `CONTAINER_IMAGE`, `ENGINE_SOCKET_PATH`,
//!    `TOKEN_SIGNING_KEY`, `IDLE_SWEEP_INTERVAL`, `READINESS_TIMEOUT`,
//!    `BIND_ADDR`, `EXTENSIONS_DIR`
//! 3. Built-in defaults

use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::env;

/// Default file-based configuration, merged under environment overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub workspace_dir: Option<PathBuf>,
    pub container_image: Option<String>,
    pub engine_socket_path: Option<String>,
    pub token_signing_key: Option<String>,
    pub idle_sweep_interval_secs: Option<u64>,
    pub readiness_timeout_secs: Option<u64>,
    pub bind_addr: Option<SocketAddr>,
    pub extensions_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Load from TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FileConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host workspace root (`workspace/` in the layout)
    pub workspace_dir: PathBuf,
    /// Image every sandbox is created from
    pub container_image: String,
    /// Explicit engine socket; falls back to local defaults when unset
    pub engine_socket_path: Option<String>,
    /// HS256 key for bearer tokens
    pub token_signing_key: String,
    /// Idle sweeper tick
    pub idle_sweep_interval: Duration,
    /// Sandbox readiness deadline
    pub readiness_timeout: Duration,
    /// HTTP/WebSocket listen address
    pub bind_addr: SocketAddr,
    /// Managed extension bundle (`extensions/.claude`)
    pub extensions_dir: PathBuf,
}

impl Config {
    /// Resolve configuration: file values overridden by the environment.
    pub fn load(file_path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match file_path {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                FileConfig::from_toml_file(path)?
            }
            None => {
                let default = PathBuf::from("claudehub.toml");
                if default.is_file() {
                    info!("Loading configuration from: {:?}", default);
                    FileConfig::from_toml_file(&default)?
                } else {
                    debug!("No configuration file found, using defaults");
                    FileConfig::default()
                }
            }
        };

        let workspace_dir = env_path("WORKSPACE_DIR")
            .or(file.workspace_dir)
            .unwrap_or_else(|| PathBuf::from("./workspace"));

        let extensions_dir = env_path("EXTENSIONS_DIR")
            .or(file.extensions_dir)
            .unwrap_or_else(|| default_extensions_dir(&workspace_dir));

        let token_signing_key = std_env::var("TOKEN_SIGNING_KEY")
            .ok()
            .or(file.token_signing_key)
            .ok_or_else(|| anyhow::anyhow!("TOKEN_SIGNING_KEY is not set"))?;

        Ok(Self {
            workspace_dir,
            container_image: std_env::var("CONTAINER_IMAGE")
                .ok()
                .or(file.container_image)
                .unwrap_or_else(|| "claude-code-sandbox:latest".to_string()),
            engine_socket_path: std_env::var("ENGINE_SOCKET_PATH")
                .ok()
                .or(file.engine_socket_path),
            token_signing_key,
            idle_sweep_interval: Duration::from_secs(
                env_u64("IDLE_SWEEP_INTERVAL")
                    .or(file.idle_sweep_interval_secs)
                    .unwrap_or(300),
            ),
            readiness_timeout: Duration::from_secs(
                env_u64("READINESS_TIMEOUT")
                    .or(file.readiness_timeout_secs)
                    .unwrap_or(60),
            ),
            bind_addr: std_env::var("BIND_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(file.bind_addr)
                .unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
            extensions_dir,
        })
    }

    /// Path of the embedded database file.
    pub fn database_path(&self) -> PathBuf {
        env::database_path(&self.workspace_dir)
    }
}

/// The managed bundle defaults to `extensions/.claude` next to the
/// workspace root.
fn default_extensions_dir(workspace_dir: &Path) -> PathBuf {
    workspace_dir
        .parent()
        .unwrap_or(workspace_dir)
        .join(env::extensions::EXTENSIONS_DIR_NAME)
        .join(env::CLAUDE_DIR_NAME)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std_env::var(key).ok().map(PathBuf::from)
}

fn env_u64(key: &str) -> Option<u64> {
    std_env::var(key).ok().and_then(|s| s.parse().ok())
}
