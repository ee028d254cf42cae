//! Sandbox orchestration layer.
//!
//! Drives the local OCI engine (Docker/Podman via the bollard API) to give
//! every user one live, resource-limited sandbox. The [`driver`] module is a
//! narrow adapter over the engine socket; the [`supervisor`] owns the
//! per-user lifecycle state machine above it.

mod client;
pub mod driver;
pub mod supervisor;
mod tier;

#[cfg(test)]
mod tests;

pub use client::EngineClient;
pub use driver::{
    BollardEngine, Engine, EngineStats, ExecChunk, ExecSpec, ExecStream, ManagedContainer,
    SandboxSpec, SandboxStatus,
};
pub use supervisor::{SandboxHandle, Supervisor, SupervisorConfig};
pub use tier::{Tier, TierLimits};

/// Sandbox provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Image could not be pulled from the registry
    #[error("image pull failed: {0}")]
    ImagePullFailure(String),

    /// Engine refused the request for lack of resources
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Container did not reach running within the deadline
    #[error("sandbox not ready within deadline: {0}")]
    ReadinessTimeout(String),

    /// Engine socket unreachable past the retry ceiling
    #[error("container engine unreachable: {0}")]
    EngineUnreachable(String),

    /// Bind-volume creation failed
    #[error("volume create failed: {0}")]
    VolumeCreateFailure(String),

    /// Service tier string not in the contract table
    #[error("unknown tier: {0}")]
    UnknownTier(String),

    /// Target container or exec is gone
    #[error("not found: {0}")]
    NotFound(String),

    /// Engine API error that maps to no narrower kind
    #[error("engine API error: {0}")]
    Engine(#[from] bollard::errors::Error),

    /// Workspace provisioning failed underneath the supervisor
    #[error(transparent)]
    Workspace(#[from] crate::workspace::WorkspaceError),

    /// Persistence failed underneath the supervisor
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("sandbox error: {0}")]
    Other(String),
}

impl ProvisionError {
    /// Stable error kind string used in wire frames and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::ImagePullFailure(_) => "ImagePullFailure",
            ProvisionError::ResourceExhausted(_) => "ResourceExhausted",
            ProvisionError::ReadinessTimeout(_) => "ReadinessTimeout",
            ProvisionError::EngineUnreachable(_) => "EngineUnreachable",
            ProvisionError::VolumeCreateFailure(_) => "VolumeCreateFailure",
            ProvisionError::UnknownTier(_) => "UnknownTier",
            ProvisionError::NotFound(_) => "NotFound",
            ProvisionError::Engine(_) => "EngineError",
            ProvisionError::Workspace(e) => e.kind(),
            ProvisionError::Store(_) => "StoreError",
            ProvisionError::Io(_) => "IoError",
            ProvisionError::Other(_) => "SandboxError",
        }
    }
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
