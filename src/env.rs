//! Path constants and helpers for the on-host workspace layout.
//!
//! This module centralizes every directory and file name used by the
//! platform so the layout convention lives in one place.

use std::path::{Path, PathBuf};

/// Agent configuration directory name (hidden directory like .git, .vscode)
pub const CLAUDE_DIR_NAME: &str = ".claude";

/// Per-user directory prefix under `workspace/users/`
pub const USER_DIR_PREFIX: &str = "user_";

/// Mount point of the user data directory inside the sandbox
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Container name prefix; full name is `claude-user-<id>`
pub const CONTAINER_NAME_PREFIX: &str = "claude-user-";

/// Engine label carrying the owning user id
pub const LABEL_USER: &str = "com.claude-code.user";

/// Engine label marking containers managed by this platform
pub const LABEL_MANAGED: &str = "com.claude-code.managed";

/// Sub-directories of `.claude` created for every user
pub const CLAUDE_SUBDIRS: [&str; 6] = [
    "agents",
    "commands",
    "skills",
    "hooks",
    "knowledge",
    "sessions",
];

/// Workspace-level directory and file names
pub mod workspace {
    /// Directory holding the embedded database
    pub const DATABASE_DIR_NAME: &str = "database";

    /// Database file name
    pub const DATABASE_FILE_NAME: &str = "auth.db";

    /// Per-user data directories live under this directory
    pub const USERS_DIR_NAME: &str = "users";

    /// Data directory name inside each user directory
    pub const DATA_DIR_NAME: &str = "data";

    /// Container support files (seccomp profile)
    pub const CONTAINERS_DIR_NAME: &str = "containers";

    /// Seccomp sub-directory and profile file
    pub const SECCOMP_DIR_NAME: &str = "seccomp";
    pub const SECCOMP_PROFILE_NAME: &str = "claude-code.json";

    /// Server log directory
    pub const LOGS_DIR_NAME: &str = "logs";

    /// Backup directory
    pub const BACKUPS_DIR_NAME: &str = "backups";
}

/// Session ledger names under `.claude/sessions/<id>/`
pub mod session {
    /// Sessions directory name within .claude
    pub const SESSIONS_DIR_NAME: &str = "sessions";

    /// Append-only message ledger file name
    pub const MESSAGES_FILE_NAME: &str = "messages.jsonl";

    /// Legacy project-scoped history directory (migrated lazily)
    pub const LEGACY_PROJECTS_DIR_NAME: &str = "projects";
}

/// Managed extension bundle names
pub mod extensions {
    /// Default bundle directory name, sibling of the workspace root
    pub const EXTENSIONS_DIR_NAME: &str = "extensions";
}

/// Build the database file path from the workspace root
pub fn database_path(workspace_root: &Path) -> PathBuf {
    workspace_root
        .join(workspace::DATABASE_DIR_NAME)
        .join(workspace::DATABASE_FILE_NAME)
}

/// Build the per-user data directory path from the workspace root
pub fn user_data_dir(workspace_root: &Path, user_id: i64) -> PathBuf {
    workspace_root
        .join(workspace::USERS_DIR_NAME)
        .join(format!("{}{}", USER_DIR_PREFIX, user_id))
        .join(workspace::DATA_DIR_NAME)
}

/// Build the `.claude` directory path for a user
pub fn claude_dir(workspace_root: &Path, user_id: i64) -> PathBuf {
    user_data_dir(workspace_root, user_id).join(CLAUDE_DIR_NAME)
}

/// Build the sessions directory for a user
pub fn sessions_dir(workspace_root: &Path, user_id: i64) -> PathBuf {
    claude_dir(workspace_root, user_id).join(session::SESSIONS_DIR_NAME)
}

/// Build a specific session directory for a user
pub fn session_dir(workspace_root: &Path, user_id: i64, session_id: &str) -> PathBuf {
    sessions_dir(workspace_root, user_id).join(session_id)
}

/// Build the message ledger path for a session
pub fn session_messages_path(workspace_root: &Path, user_id: i64, session_id: &str) -> PathBuf {
    session_dir(workspace_root, user_id, session_id).join(session::MESSAGES_FILE_NAME)
}

/// Build the seccomp profile path from the workspace root
pub fn seccomp_profile_path(workspace_root: &Path) -> PathBuf {
    workspace_root
        .join(workspace::CONTAINERS_DIR_NAME)
        .join(workspace::SECCOMP_DIR_NAME)
        .join(workspace::SECCOMP_PROFILE_NAME)
}

/// Build the container name for a user
pub fn container_name(user_id: i64) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, user_id)
}

/// Build the bind-volume name for a user's data directory
pub fn volume_name(user_id: i64) -> String {
    format!("claude-user-{}-data", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_path_construction() {
        let root = Path::new("/srv/workspace");

        assert_eq!(
            database_path(root),
            Path::new("/srv/workspace/database/auth.db")
        );

        assert_eq!(
            user_data_dir(root, 7),
            Path::new("/srv/workspace/users/user_7/data")
        );

        assert_eq!(
            claude_dir(root, 7),
            Path::new("/srv/workspace/users/user_7/data/.claude")
        );

        assert_eq!(
            session_messages_path(root, 7, "abc"),
            Path::new("/srv/workspace/users/user_7/data/.claude/sessions/abc/messages.jsonl")
        );

        assert_eq!(
            seccomp_profile_path(root),
            Path::new("/srv/workspace/containers/seccomp/claude-code.json")
        );
    }

    #[test]
    fn test_container_naming() {
        assert_eq!(container_name(42), "claude-user-42");
        assert_eq!(volume_name(42), "claude-user-42-data");
    }
}
