//! Managed extension bundle synchronisation.
//!
//! The admin-owned bundle under `extensions/.claude` is copied into each
//! user's `.claude` directory on registration and on admin push. The
//! bind-mount makes new files visible inside the sandbox immediately; no
//! container restart is required.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{Result, WorkspaceError, WorkspaceLayout};

/// What a sub-tree of the bundle may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    /// Plain files matching the extension allow-list
    Files,
    /// Whole sub-directories copied recursively
    Directories,
    /// Both files (allow-listed) and sub-directories
    FilesAndDirectories,
}

/// One row per managed sub-tree; the walk is driven entirely by this table.
const SYNC_TABLE: [(&str, &[&str], EntryKind); 5] = [
    ("agents", &["json"], EntryKind::Files),
    ("commands", &["md"], EntryKind::Files),
    ("skills", &[], EntryKind::Directories),
    ("hooks", &["js", "md"], EntryKind::FilesAndDirectories),
    ("knowledge", &["md", "txt"], EntryKind::FilesAndDirectories),
];

/// Names never copied regardless of sub-tree.
const EXCLUDED_NAMES: [&str; 1] = ["README.md"];

/// Handle to the managed source-of-truth directory.
#[derive(Debug, Clone)]
pub struct ExtensionBundle {
    source_dir: PathBuf,
}

impl ExtensionBundle {
    pub fn new(source_dir: PathBuf) -> Self {
        Self { source_dir }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// List bundle entries per sub-tree, for the admin surface.
    pub fn inventory(&self) -> Vec<(String, Vec<String>)> {
        SYNC_TABLE
            .iter()
            .map(|(subtree, _, _)| {
                let dir = self.source_dir.join(subtree);
                let mut names: Vec<String> = fs::read_dir(&dir)
                    .map(|entries| {
                        entries
                            .flatten()
                            .filter_map(|e| e.file_name().into_string().ok())
                            .filter(|name| !is_excluded(name))
                            .collect()
                    })
                    .unwrap_or_default();
                names.sort();
                (subtree.to_string(), names)
            })
            .collect()
    }
}

/// Outcome of a fan-out sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Copies the managed bundle into user `.claude` trees.
#[derive(Debug, Clone)]
pub struct ExtensionSynchroniser {
    bundle: ExtensionBundle,
    layout: WorkspaceLayout,
}

impl ExtensionSynchroniser {
    pub fn new(bundle: ExtensionBundle, layout: WorkspaceLayout) -> Self {
        Self { bundle, layout }
    }

    pub fn bundle(&self) -> &ExtensionBundle {
        &self.bundle
    }

    /// Copy the bundle into one user's `.claude` tree.
    ///
    /// Existing targets are overwritten only when `overwrite_user_files` is
    /// set, so user-modified copies survive a default push. Writes are
    /// per-file; a mid-way failure leaves a partially updated tree that a
    /// re-run with the same flag converges.
    pub fn sync_one(&self, user_id: i64, overwrite_user_files: bool) -> Result<usize> {
        self.layout.ensure_layout(user_id)?;
        let target_claude = self
            .layout
            .host_data_dir(user_id)
            .join(crate::env::CLAUDE_DIR_NAME);

        let mut copied = 0;
        for (subtree, extensions, kind) in SYNC_TABLE {
            let source = self.bundle.source_dir.join(subtree);
            if !source.is_dir() {
                continue;
            }
            let target = target_claude.join(subtree);
            copied += sync_subtree(&source, &target, extensions, kind, overwrite_user_files)?;
        }

        debug!(user_id, copied, overwrite_user_files, "extension sync complete");
        Ok(copied)
    }

    /// Fan `sync_one` over all given users, collecting per-user failures.
    /// Partial success is not an error.
    pub fn sync_all(&self, user_ids: &[i64], overwrite_user_files: bool) -> SyncReport {
        let mut report = SyncReport {
            total: user_ids.len(),
            ..Default::default()
        };

        for &user_id in user_ids {
            match self.sync_one(user_id, overwrite_user_files) {
                Ok(_) => report.synced += 1,
                Err(e) => {
                    warn!(user_id, error = %e, "extension sync failed");
                    report.failed += 1;
                    report.errors.push(format!("user {}: {}", user_id, e));
                }
            }
        }

        info!(
            total = report.total,
            synced = report.synced,
            failed = report.failed,
            "extension sync-all finished"
        );
        report
    }
}

fn sync_subtree(
    source: &Path,
    target: &Path,
    extensions: &[&str],
    kind: EntryKind,
    overwrite: bool,
) -> Result<usize> {
    fs::create_dir_all(target).map_err(|e| WorkspaceError::from_io(e, target))?;

    let mut copied = 0;
    let entries = fs::read_dir(source).map_err(|e| WorkspaceError::from_io(e, source))?;
    for entry in entries {
        let entry = entry.map_err(WorkspaceError::Io)?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if is_excluded(&name_str) {
            continue;
        }

        let source_path = entry.path();
        let target_path = target.join(&name);

        if source_path.is_dir() {
            if matches!(kind, EntryKind::Directories | EntryKind::FilesAndDirectories) {
                copied += copy_dir_recursive(&source_path, &target_path, overwrite)?;
            }
        } else if matches!(kind, EntryKind::Files | EntryKind::FilesAndDirectories)
            && extension_allowed(&source_path, extensions)
        {
            copied += copy_file(&source_path, &target_path, overwrite)?;
        }
    }
    Ok(copied)
}

fn copy_dir_recursive(source: &Path, target: &Path, overwrite: bool) -> Result<usize> {
    fs::create_dir_all(target).map_err(|e| WorkspaceError::from_io(e, target))?;

    let mut copied = 0;
    let entries = fs::read_dir(source).map_err(|e| WorkspaceError::from_io(e, source))?;
    for entry in entries {
        let entry = entry.map_err(WorkspaceError::Io)?;
        let name = entry.file_name();
        if is_excluded(&name.to_string_lossy()) {
            continue;
        }
        let source_path = entry.path();
        let target_path = target.join(&name);
        if source_path.is_dir() {
            copied += copy_dir_recursive(&source_path, &target_path, overwrite)?;
        } else {
            copied += copy_file(&source_path, &target_path, overwrite)?;
        }
    }
    Ok(copied)
}

fn copy_file(source: &Path, target: &Path, overwrite: bool) -> Result<usize> {
    if target.exists() && !overwrite {
        debug!(target = %target.display(), "skipping existing file");
        return Ok(0);
    }
    fs::copy(source, target).map_err(|e| WorkspaceError::from_io(e, target))?;
    Ok(1)
}

fn extension_allowed(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e))
        .unwrap_or(false)
}

/// Dot-files and README.md never leave the bundle.
fn is_excluded(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        sync: ExtensionSynchroniser,
        layout: WorkspaceLayout,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let bundle_dir = root.path().join("extensions/.claude");
        for sub in ["agents", "commands", "skills/code-review", "hooks", "knowledge"] {
            fs::create_dir_all(bundle_dir.join(sub)).unwrap();
        }
        fs::write(bundle_dir.join("agents/reviewer.json"), "{}").unwrap();
        fs::write(bundle_dir.join("agents/notes.txt"), "not json").unwrap();
        fs::write(bundle_dir.join("commands/deploy.md"), "# deploy").unwrap();
        fs::write(bundle_dir.join("commands/README.md"), "docs").unwrap();
        fs::write(bundle_dir.join("commands/.hidden.md"), "dot").unwrap();
        fs::write(bundle_dir.join("skills/code-review/SKILL.md"), "skill").unwrap();
        fs::write(bundle_dir.join("hooks/pre-commit.js"), "hook").unwrap();
        fs::write(bundle_dir.join("knowledge/style.md"), "style").unwrap();

        let layout = WorkspaceLayout::new(root.path().join("workspace"));
        let sync = ExtensionSynchroniser::new(ExtensionBundle::new(bundle_dir), layout.clone());
        Fixture { _root: root, sync, layout }
    }

    fn claude_dir(f: &Fixture, user: i64) -> PathBuf {
        f.layout.host_data_dir(user).join(".claude")
    }

    #[test]
    fn test_sync_installs_bundle() {
        let f = fixture();
        let copied = f.sync.sync_one(1, false).unwrap();
        assert_eq!(copied, 5);

        let claude = claude_dir(&f, 1);
        assert!(claude.join("agents/reviewer.json").is_file());
        assert!(claude.join("commands/deploy.md").is_file());
        assert!(claude.join("skills/code-review/SKILL.md").is_file());
        assert!(claude.join("hooks/pre-commit.js").is_file());
        assert!(claude.join("knowledge/style.md").is_file());
    }

    #[test]
    fn test_sync_excludes_readme_dotfiles_and_foreign_extensions() {
        let f = fixture();
        f.sync.sync_one(1, false).unwrap();

        let claude = claude_dir(&f, 1);
        assert!(!claude.join("commands/README.md").exists());
        assert!(!claude.join("commands/.hidden.md").exists());
        assert!(!claude.join("agents/notes.txt").exists());
    }

    #[test]
    fn test_sync_preserves_user_edits_without_overwrite() {
        let f = fixture();
        f.sync.sync_one(1, false).unwrap();

        let target = claude_dir(&f, 1).join("commands/deploy.md");
        fs::write(&target, "user edit").unwrap();

        let copied = f.sync.sync_one(1, false).unwrap();
        assert_eq!(copied, 0);
        assert_eq!(fs::read_to_string(&target).unwrap(), "user edit");
    }

    #[test]
    fn test_sync_overwrite_replaces_user_edits() {
        let f = fixture();
        f.sync.sync_one(1, false).unwrap();

        let target = claude_dir(&f, 1).join("commands/deploy.md");
        fs::write(&target, "user edit").unwrap();

        f.sync.sync_one(1, true).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "# deploy");
    }

    #[test]
    fn test_sync_overwrite_is_idempotent() {
        let f = fixture();
        f.sync.sync_one(1, true).unwrap();
        let first = snapshot(&claude_dir(&f, 1));
        f.sync.sync_one(1, true).unwrap();
        assert_eq!(first, snapshot(&claude_dir(&f, 1)));
    }

    #[test]
    fn test_sync_leaves_unmanaged_files_alone() {
        let f = fixture();
        f.sync.sync_one(1, true).unwrap();

        let own = claude_dir(&f, 1).join("sessions/own-note.txt");
        fs::write(&own, "mine").unwrap();
        f.sync.sync_one(1, true).unwrap();
        assert_eq!(fs::read_to_string(&own).unwrap(), "mine");
    }

    #[test]
    fn test_sync_all_reports_per_user() {
        let f = fixture();
        let report = f.sync.sync_all(&[1, 2, 3], false);
        assert_eq!(report.total, 3);
        assert_eq!(report.synced, 3);
        assert_eq!(report.failed, 0);
        assert!(report.errors.is_empty());
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files = Vec::new();
        collect(dir, &mut files);
        files.sort();
        files
    }

    fn collect(dir: &Path, out: &mut Vec<(PathBuf, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect(&path, out);
            } else {
                out.push((path.clone(), fs::read(&path).unwrap()));
            }
        }
    }
}
