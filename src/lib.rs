//! # Claudehub
//!
//! A multi-tenant execution platform that runs the Claude Code agent inside
//! per-user Linux containers. Authenticated users drive the agent over a
//! bidirectional WebSocket; the platform owns the sandbox lifecycle, the
//! streaming session layer, and the provisioned workspace tree.
//!
//! ## Architecture Overview
//!
//! - **[`workspace`]**: per-user directory layout and the managed extension
//!   bundle synchronised into each user's `.claude` tree
//! - **[`container`]**: the engine driver and the per-user sandbox
//!   supervisor (warm sandboxes, readiness, idle eviction, crash recovery)
//! - **[`session`]**: logical conversations above sandboxes, with an
//!   append-only JSONL ledger per session
//! - **[`server`]**: the HTTP control surface and the per-connection
//!   WebSocket stream multiplexer
//! - **[`store`]**: the embedded relational store for identity and state
//!
//! Construction is explicit: `main` wires store → layout → synchroniser →
//! engine → supervisor → session manager → router, and every component
//! holds plain values rather than resolving globals.

/// Path constants and helpers for the on-host layout.
pub mod env;

/// Runtime configuration from environment and optional TOML file.
pub mod config;

/// Workspace layout and extension bundle provisioning.
pub mod workspace;

/// Sandbox driver and supervisor.
pub mod container;

/// Logical sessions, wire frames, and the message ledger.
pub mod session;

/// HTTP control surface and WebSocket multiplexer.
pub mod server;

/// Embedded relational store.
pub mod store;

pub use config::Config;
pub use container::{
    BollardEngine, Engine, EngineClient, ProvisionError, SandboxHandle, Supervisor,
    SupervisorConfig, Tier,
};
pub use server::{AppState, TokenIssuer};
pub use session::{SessionError, SessionManager};
pub use store::Store;
pub use workspace::{ExtensionBundle, ExtensionSynchroniser, WorkspaceLayout};
