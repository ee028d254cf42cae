//! Workspace provisioning layer.
//!
//! Owns the on-disk directory convention for per-user data directories and
//! the managed extension bundle that is synchronised into each user's
//! `.claude` tree. Everything under a user's data directory is bind-mounted
//! into that user's sandbox at `/workspace`.

mod extensions;
mod layout;

pub use extensions::{ExtensionBundle, ExtensionSynchroniser, SyncReport};
pub use layout::WorkspaceLayout;

/// Workspace filesystem errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Path escapes the workspace after lexical cleaning
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    /// No space left while provisioning
    #[error("disk full while writing {0}")]
    DiskFull(String),

    /// Requested file is absent
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Other IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Stable error kind string used in wire frames and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkspaceError::PathTraversal(_) => "PathTraversal",
            WorkspaceError::DiskFull(_) => "DiskFull",
            WorkspaceError::FileNotFound(_) => "FileNotFound",
            WorkspaceError::Io(_) => "IoError",
        }
    }

    /// Classify an IO error, surfacing disk-full as its own kind.
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        if err.raw_os_error() == Some(libc_enospc()) {
            WorkspaceError::DiskFull(path.display().to_string())
        } else if err.kind() == std::io::ErrorKind::NotFound {
            WorkspaceError::FileNotFound(path.display().to_string())
        } else {
            WorkspaceError::Io(err)
        }
    }
}

// ENOSPC without pulling in libc for one constant.
const fn libc_enospc() -> i32 {
    28
}

/// Result type for workspace operations.
pub type Result<T> = std::result::Result<T, WorkspaceError>;
