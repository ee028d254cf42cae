//! End-to-end workspace provisioning scenarios on a temporary tree.

use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use claudehub::workspace::{ExtensionBundle, ExtensionSynchroniser, WorkspaceLayout};

struct Platform {
    _root: TempDir,
    layout: WorkspaceLayout,
    synchroniser: ExtensionSynchroniser,
    bundle_dir: PathBuf,
}

fn platform() -> Platform {
    let root = TempDir::new().unwrap();
    let bundle_dir = root.path().join("extensions/.claude");
    for sub in ["agents", "commands", "skills", "hooks", "knowledge"] {
        fs::create_dir_all(bundle_dir.join(sub)).unwrap();
    }
    fs::write(bundle_dir.join("agents/reviewer.json"), "{}").unwrap();
    fs::write(bundle_dir.join("commands/deploy.md"), "# deploy").unwrap();

    let layout = WorkspaceLayout::new(root.path().join("workspace"));
    let synchroniser =
        ExtensionSynchroniser::new(ExtensionBundle::new(bundle_dir.clone()), layout.clone());
    Platform {
        _root: root,
        layout,
        synchroniser,
        bundle_dir,
    }
}

#[test]
fn first_login_installs_the_default_bundle() {
    let p = platform();
    p.layout.ensure_layout(1).unwrap();
    p.synchroniser.sync_one(1, false).unwrap();

    let claude = p.layout.host_data_dir(1).join(".claude");
    assert!(claude.join("agents/reviewer.json").is_file());
    assert!(claude.join("commands/deploy.md").is_file());
    assert!(claude.join("sessions").is_dir());
}

#[test]
fn admin_push_lands_in_every_user_tree_without_restart() {
    let p = platform();
    let users = [1, 2, 3];
    for &user in &users {
        p.synchroniser.sync_one(user, false).unwrap();
    }

    // Admin drops a new skill into the managed bundle and pushes.
    let skill = p.bundle_dir.join("skills/code-review/SKILL.md");
    fs::create_dir_all(skill.parent().unwrap()).unwrap();
    fs::write(&skill, "review the diff").unwrap();

    let report = p.synchroniser.sync_all(&users, true);
    assert_eq!(report.total, 3);
    assert_eq!(report.synced, 3);
    assert_eq!(report.failed, 0);

    for &user in &users {
        // The bind-mounted tree shows the file as soon as it lands.
        let installed = p
            .layout
            .host_data_dir(user)
            .join(".claude/skills/code-review/SKILL.md");
        assert_eq!(fs::read_to_string(installed).unwrap(), "review the diff");
    }
}

#[test]
fn default_push_leaves_user_modified_files_alone() {
    let p = platform();
    p.synchroniser.sync_one(7, false).unwrap();

    let target = p.layout.host_data_dir(7).join(".claude/commands/deploy.md");
    fs::write(&target, "my custom deploy").unwrap();

    p.synchroniser.sync_all(&[7], false);
    assert_eq!(fs::read_to_string(&target).unwrap(), "my custom deploy");

    // A forced push restores the managed copy.
    p.synchroniser.sync_all(&[7], true);
    assert_eq!(fs::read_to_string(&target).unwrap(), "# deploy");
}

#[test]
fn client_paths_never_escape_the_workspace() {
    let p = platform();
    p.layout.ensure_layout(1).unwrap();

    assert!(p.layout.resolve_client_path(1, "my-workspace/src").is_ok());
    assert!(p.layout.resolve_client_path(1, "../etc/passwd").is_err());
    assert!(p
        .layout
        .resolve_client_path(1, "/workspace/../../database/auth.db")
        .is_err());
}
