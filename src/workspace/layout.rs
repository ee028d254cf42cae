//! Per-user directory layout and path resolution.
//!
//! Every user owns `workspace/users/user_<id>/data/`, which the sandbox
//! mounts at `/workspace` with `HOME=/workspace`. `~/.claude` inside the
//! sandbox is therefore exactly the host's `.claude` subtree. Paths handed
//! to clients are always container-relative; host paths never leak outward.

use std::path::{Component, Path, PathBuf};
use tracing::debug;

use super::{Result, WorkspaceError};
use crate::env;

/// Pure path operations over the workspace tree.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    workspace_root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }

    /// The workspace root this layout is anchored at.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Host data directory for a user; mounted at `/workspace` in the sandbox.
    pub fn host_data_dir(&self, user_id: i64) -> PathBuf {
        env::user_data_dir(&self.workspace_root, user_id)
    }

    /// Host path of a session's message ledger.
    pub fn session_messages_path(&self, user_id: i64, session_id: &str) -> PathBuf {
        env::session_messages_path(&self.workspace_root, user_id, session_id)
    }

    /// Idempotently create the user's directory tree:
    /// `.claude/{agents,commands,skills,hooks,knowledge,sessions}`.
    ///
    /// Safe under concurrent callers; `create_dir_all` tolerates the
    /// directory already existing.
    pub fn ensure_layout(&self, user_id: i64) -> Result<()> {
        let data_dir = self.host_data_dir(user_id);
        let claude_dir = data_dir.join(env::CLAUDE_DIR_NAME);

        for sub in env::CLAUDE_SUBDIRS {
            let dir = claude_dir.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| WorkspaceError::from_io(e, &dir))?;
        }

        debug!(user_id, path = %data_dir.display(), "workspace layout ensured");
        Ok(())
    }

    /// Translate a host path under the user's data directory into its
    /// container-visible `/workspace/...` form.
    pub fn to_container_path(&self, user_id: i64, host_path: &Path) -> Result<PathBuf> {
        let data_dir = self.host_data_dir(user_id);
        let cleaned = lexical_clean(host_path);
        let relative = cleaned.strip_prefix(&data_dir).map_err(|_| {
            WorkspaceError::PathTraversal(host_path.display().to_string())
        })?;
        Ok(Path::new(env::CONTAINER_WORKSPACE).join(relative))
    }

    /// Resolve a client-supplied path relative to `/workspace` back into a
    /// host path, rejecting anything that escapes the data directory.
    pub fn resolve_client_path(&self, user_id: i64, client_path: &str) -> Result<PathBuf> {
        let trimmed = client_path
            .strip_prefix(env::CONTAINER_WORKSPACE)
            .map(|p| p.trim_start_matches('/'))
            .unwrap_or(client_path);

        let candidate = self.host_data_dir(user_id).join(trimmed);
        let cleaned = lexical_clean(&candidate);

        if !cleaned.starts_with(self.host_data_dir(user_id)) {
            return Err(WorkspaceError::PathTraversal(client_path.to_string()));
        }
        Ok(cleaned)
    }

    /// Container-relative display form of a path inside the sandbox.
    pub fn to_display_path(&self, container_path: &str) -> String {
        let cleaned = lexical_clean(Path::new(container_path));
        if cleaned.starts_with(env::CONTAINER_WORKSPACE) {
            cleaned.display().to_string()
        } else {
            format!(
                "{}/{}",
                env::CONTAINER_WORKSPACE,
                cleaned.display().to_string().trim_start_matches('/')
            )
        }
    }
}

/// Lexically clean a path: resolve `.` and `..` components without touching
/// the filesystem. `..` at the root is preserved so escape attempts remain
/// visible to the prefix checks above.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, WorkspaceLayout) {
        let dir = TempDir::new().unwrap();
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        (dir, layout)
    }

    #[test]
    fn test_ensure_layout_creates_claude_tree() {
        let (_dir, layout) = layout();
        layout.ensure_layout(1).unwrap();

        let claude = layout.host_data_dir(1).join(".claude");
        for sub in env::CLAUDE_SUBDIRS {
            assert!(claude.join(sub).is_dir(), "missing {}", sub);
        }
    }

    #[test]
    fn test_ensure_layout_is_idempotent() {
        let (_dir, layout) = layout();
        layout.ensure_layout(1).unwrap();
        layout.ensure_layout(1).unwrap();
    }

    #[test]
    fn test_to_container_path() {
        let (_dir, layout) = layout();
        let host = layout.host_data_dir(3).join("my-project/src/main.rs");
        let container = layout.to_container_path(3, &host).unwrap();
        assert_eq!(container, Path::new("/workspace/my-project/src/main.rs"));
    }

    #[test]
    fn test_to_container_path_rejects_foreign_host_path() {
        let (_dir, layout) = layout();
        let err = layout
            .to_container_path(3, Path::new("/etc/passwd"))
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::PathTraversal(_)));
    }

    #[test]
    fn test_resolve_client_path() {
        let (_dir, layout) = layout();
        let host = layout.resolve_client_path(2, "my-project/notes.md").unwrap();
        assert_eq!(host, layout.host_data_dir(2).join("my-project/notes.md"));

        let host = layout
            .resolve_client_path(2, "/workspace/my-project/notes.md")
            .unwrap();
        assert_eq!(host, layout.host_data_dir(2).join("my-project/notes.md"));
    }

    #[test]
    fn test_resolve_client_path_rejects_traversal() {
        let (_dir, layout) = layout();
        for bad in ["../etc/passwd", "/workspace/../../etc/passwd", "a/../../.."] {
            let err = layout.resolve_client_path(2, bad).unwrap_err();
            assert!(
                matches!(err, WorkspaceError::PathTraversal(_)),
                "expected traversal rejection for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_display_path_normalisation() {
        let (_dir, layout) = layout();
        assert_eq!(
            layout.to_display_path("/workspace/project/./a.txt"),
            "/workspace/project/a.txt"
        );
        assert_eq!(layout.to_display_path("project/a.txt"), "/workspace/project/a.txt");
    }
}
