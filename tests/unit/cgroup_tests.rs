//! Unit tests for per-agent cgroup management against fake hierarchies.
//!
//! A fake hierarchy is a temp directory that carries `cgroup.controllers`
//! but, unlike cgroupfs, never materialises interface files on `mkdir`.

use std::path::{Path, PathBuf};

use agent_kernel::config::CgroupConfig;
use agent_kernel::kernel::cgroup::{is_cgroup2_hierarchy, procs_path, remove_scope, CgroupManager};
use agent_kernel::models::agent::LaunchErrorKind;

fn manager(root: &Path) -> CgroupManager {
    CgroupManager::new(&CgroupConfig {
        enabled: true,
        root: root.to_path_buf(),
    })
}

fn fake_hierarchy() -> tempfile::TempDir {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::write(root.path().join("cgroup.controllers"), "cpu memory io\n").expect("write");
    root
}

#[test]
fn scope_names_carry_kernel_instance() {
    let manager = manager(Path::new("/sys/fs/cgroup/agent-kernel"));
    let expected = PathBuf::from(format!(
        "/sys/fs/cgroup/agent-kernel/agent-{}-7",
        std::process::id()
    ));
    assert_eq!(manager.scope_path(7), expected);
    assert_eq!(procs_path(&manager.scope_path(7)), expected.join("cgroup.procs"));
}

#[test]
fn hierarchy_detection_uses_cgroup_controllers() {
    let plain = tempfile::tempdir().expect("tempdir");
    assert!(!is_cgroup2_hierarchy(plain.path()));
    assert!(!is_cgroup2_hierarchy(&plain.path().join("agent-kernel")));

    let fake = fake_hierarchy();
    assert!(is_cgroup2_hierarchy(fake.path()));
    // A root that does not exist yet is judged by its parent.
    assert!(is_cgroup2_hierarchy(&fake.path().join("agent-kernel")));
}

#[tokio::test]
async fn plain_directory_rejects_limit_and_creates_nothing() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = manager(root.path());

    let err = manager
        .create_scope(3, Some(4 * 1024 * 1024))
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);
    assert!(!manager.scope_path(3).exists());
    assert!(!root.path().join("memory.max").exists());
}

#[tokio::test]
async fn plain_directory_without_limit_runs_unconfined() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = manager(root.path());

    assert!(manager.create_scope(4, None).await.expect("ok").is_none());
    assert!(!manager.scope_path(4).exists());
}

#[tokio::test]
async fn limit_needs_kernel_provided_memory_max() {
    let root = fake_hierarchy();
    let manager = manager(root.path());

    let err = manager
        .create_scope(3, Some(64 * 1024 * 1024))
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);

    // The scope this call created is gone; no stray memory.max was written.
    assert!(!manager.scope_path(3).exists());
}

#[tokio::test]
async fn creates_scope_without_limit() {
    let root = fake_hierarchy();
    let scope = manager(root.path())
        .create_scope(4, None)
        .await
        .expect("scope")
        .expect("cgroup enabled");

    assert!(scope.is_dir());
    assert!(scope.starts_with(root.path()));
    assert!(!scope.join("memory.max").exists());
}

#[tokio::test]
async fn enables_memory_controller_when_present() {
    let root = fake_hierarchy();
    std::fs::write(root.path().join("cgroup.subtree_control"), "").expect("write");

    manager(root.path())
        .create_scope(5, None)
        .await
        .expect("scope");

    let control =
        std::fs::read_to_string(root.path().join("cgroup.subtree_control")).expect("read");
    assert_eq!(control, "+memory");
}

#[tokio::test]
async fn existing_scope_is_left_alone() {
    let root = fake_hierarchy();
    let manager = manager(root.path());
    let stale = manager.scope_path(1);
    std::fs::create_dir(&stale).expect("mkdir");
    std::fs::write(stale.join("marker"), "earlier run").expect("write");

    let err = manager
        .create_scope(1, Some(64 * 1024 * 1024))
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);

    // Not created by this call, so not removed by it either.
    assert!(stale.join("marker").is_file());
    let err = manager
        .create_scope(1, Some(64 * 1024 * 1024))
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);
}

#[tokio::test]
async fn disabled_manager_runs_unconfined_without_limit() {
    let scope = CgroupManager::disabled()
        .create_scope(1, None)
        .await
        .expect("no error");
    assert!(scope.is_none());
}

#[tokio::test]
async fn disabled_manager_rejects_memory_limit() {
    let err = CgroupManager::disabled()
        .create_scope(1, Some(1024))
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);
}

#[tokio::test]
async fn unusable_root_rejects_limit_but_tolerates_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A regular file where the hierarchy root should be.
    let bogus_root = dir.path().join("not-a-dir");
    std::fs::write(&bogus_root, "x").expect("write");
    let manager = manager(&bogus_root);

    let err = manager.create_scope(2, Some(1024)).await.unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);

    assert!(manager.create_scope(3, None).await.expect("ok").is_none());
}

#[tokio::test]
async fn remove_scope_deletes_empty_directory() {
    let root = fake_hierarchy();
    let scope = manager(root.path())
        .create_scope(6, None)
        .await
        .expect("scope")
        .expect("enabled");

    remove_scope(&scope).await;
    assert!(!scope.exists());
}
