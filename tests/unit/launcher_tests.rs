//! Unit tests for program resolution and launch classification.

use agent_kernel::config::{CgroupConfig, LaunchConfig};
use agent_kernel::kernel::cgroup::{procs_path, CgroupManager};
use agent_kernel::kernel::launcher::{trampoline_command, LaunchSpec, ProcessLauncher};
use agent_kernel::kernel::lifecycle;
use agent_kernel::models::agent::{Agent, AgentState, ExitReason, ExitStatusInfo, LaunchErrorKind};
use chrono::Utc;

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new(
        LaunchConfig::default(),
        CgroupManager::disabled(),
        "launcher-test".into(),
    )
}

#[test]
fn bare_name_resolves_on_path() {
    let path = launcher().resolve_program("sh").expect("sh on PATH");
    assert!(path.is_absolute());
    assert!(path.ends_with("sh"));
}

#[test]
fn unknown_bare_name_is_not_found() {
    let err = launcher()
        .resolve_program("agent-kernel-no-such-program")
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::NotFound);
    assert_eq!(err.agent_id, None);
}

#[test]
fn paths_are_taken_verbatim() {
    let path = launcher().resolve_program("./bin/agent").expect("path");
    assert_eq!(path, std::path::PathBuf::from("./bin/agent"));
}

#[cfg(unix)]
fn write_script(path: &std::path::Path, body: &str, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, body).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).expect("chmod");
}

#[cfg(unix)]
#[test]
fn non_executable_entry_does_not_shadow_later_path_entry() {
    let first = tempfile::tempdir().expect("tempdir");
    let second = tempfile::tempdir().expect("tempdir");
    write_script(&first.path().join("worker-agent"), "#!/bin/sh\nexit 0\n", 0o644);
    write_script(&second.path().join("worker-agent"), "#!/bin/sh\nexit 0\n", 0o755);

    let search_path =
        std::env::join_paths([first.path(), second.path()]).expect("join search path");
    let resolved = launcher()
        .resolve_program_in("worker-agent", Some(search_path))
        .expect("resolves");
    assert_eq!(resolved, second.path().join("worker-agent"));
}

#[cfg(unix)]
#[test]
fn only_non_executable_entries_are_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_script(&dir.path().join("worker-agent"), "#!/bin/sh\nexit 0\n", 0o644);

    let err = launcher()
        .resolve_program_in("worker-agent", Some(dir.path().as_os_str().to_owned()))
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::NotFound);
}

#[test]
fn relative_program_is_anchored_at_working_dir() {
    let config = LaunchConfig {
        working_dir: Some("/srv/agents".into()),
        ..LaunchConfig::default()
    };
    let launcher = ProcessLauncher::new(config, CgroupManager::disabled(), "wd-test".into());
    assert_eq!(
        launcher.exec_path(std::path::Path::new("./bin/agent")),
        std::path::PathBuf::from("/srv/agents/./bin/agent")
    );
    assert_eq!(
        launcher.exec_path(std::path::Path::new("/usr/bin/agent")),
        std::path::PathBuf::from("/usr/bin/agent")
    );
}

#[cfg(unix)]
#[tokio::test]
async fn relative_program_launches_from_working_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join("bin")).expect("mkdir");
    write_script(&dir.path().join("bin/agent"), "#!/bin/sh\nexit 0\n", 0o755);

    let config = LaunchConfig {
        working_dir: Some(dir.path().to_path_buf()),
        ..LaunchConfig::default()
    };
    let launcher = ProcessLauncher::new(config, CgroupManager::disabled(), "wd-test".into());
    let mut launched = launcher
        .launch(&LaunchSpec {
            agent_id: 1,
            parent_id: None,
            program: std::path::Path::new("./bin/agent"),
            args: &[],
            memory_max_bytes: None,
        })
        .await
        .expect("launch");
    assert!(launched.child.wait().await.expect("wait").success());
}

#[cfg(unix)]
#[tokio::test]
async fn trampoline_places_agent_in_its_cgroup() {
    let root = tempfile::tempdir().expect("tempdir");
    std::fs::write(root.path().join("cgroup.controllers"), "memory\n").expect("write");
    let cgroups = CgroupManager::new(&CgroupConfig {
        enabled: true,
        root: root.path().to_path_buf(),
    });
    let launcher = ProcessLauncher::new(LaunchConfig::default(), cgroups.clone(), "cg-test".into());

    let args = vec!["-c".to_owned(), "exit 0".to_owned()];
    let mut launched = launcher
        .launch(&LaunchSpec {
            agent_id: 9,
            parent_id: None,
            program: std::path::Path::new("/bin/sh"),
            args: &args,
            memory_max_bytes: None,
        })
        .await
        .expect("launch");

    assert!(launched.trampoline);
    assert_eq!(launched.cgroup, Some(cgroups.scope_path(9)));
    assert!(launched.child.wait().await.expect("wait").success());

    let procs = std::fs::read_to_string(procs_path(&cgroups.scope_path(9))).expect("cgroup.procs");
    assert_eq!(procs.trim(), launched.pid.to_string());
}

#[cfg(unix)]
#[tokio::test]
async fn limit_on_plain_directory_is_rejected_before_launch() {
    let root = tempfile::tempdir().expect("tempdir");
    let cgroups = CgroupManager::new(&CgroupConfig {
        enabled: true,
        root: root.path().to_path_buf(),
    });
    let launcher = ProcessLauncher::new(LaunchConfig::default(), cgroups, "cg-test".into());

    let args = vec!["-c".to_owned(), "exit 0".to_owned()];
    let err = launcher
        .launch(&LaunchSpec {
            agent_id: 2,
            parent_id: None,
            program: std::path::Path::new("/bin/sh"),
            args: &args,
            memory_max_bytes: Some(4 * 1024 * 1024),
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);
}

#[cfg(unix)]
#[tokio::test]
async fn unjoinable_cgroup_is_resource_limit_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("ran");
    let procs = dir.path().join("missing-scope").join("cgroup.procs");
    let args = vec!["-c".to_owned(), format!("touch '{}'", marker.display())];

    let status = tokio::process::Command::from(trampoline_command(
        &procs,
        std::path::Path::new("/bin/sh"),
        &args,
    ))
    .stderr(std::process::Stdio::null())
    .status()
    .await
    .expect("run trampoline");
    assert!(!marker.exists(), "program ran outside its cgroup");

    let mut agent = Agent::new(5, "worker".into(), "/bin/sh".into(), args, None, None);
    lifecycle::begin_start(&mut agent, 77, Some(dir.path().join("missing-scope")), Utc::now()).expect("start");
    let state = lifecycle::observe_exit(&mut agent, ExitStatusInfo::from(status), true, Utc::now());

    assert_eq!(state, AgentState::Failed);
    assert_eq!(
        agent.exit_reason,
        Some(ExitReason::LaunchError {
            reason: LaunchErrorKind::ResourceLimitRejected
        })
    );
}

#[tokio::test]
async fn missing_path_is_exec_failed() {
    let program = std::path::Path::new("/definitely/not/here/agent");
    let err = launcher()
        .launch(&LaunchSpec {
            agent_id: 1,
            parent_id: None,
            program,
            args: &[],
            memory_max_bytes: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ExecFailed);
}

#[cfg(unix)]
#[tokio::test]
async fn non_executable_file_is_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let program = dir.path().join("agent.sh");
    std::fs::write(&program, "#!/bin/sh\nexit 0\n").expect("write");
    std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o644)).expect("chmod");

    let err = launcher()
        .launch(&LaunchSpec {
            agent_id: 1,
            parent_id: None,
            program: &program,
            args: &[],
            memory_max_bytes: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::PermissionDenied);
}

#[tokio::test]
async fn memory_limit_without_cgroups_is_rejected() {
    let err = launcher()
        .launch(&LaunchSpec {
            agent_id: 1,
            parent_id: None,
            program: std::path::Path::new("/bin/sh"),
            args: &[],
            memory_max_bytes: Some(1024 * 1024),
        })
        .await
        .unwrap_err();
    assert_eq!(err.reason, LaunchErrorKind::ResourceLimitRejected);
}

#[cfg(unix)]
#[tokio::test]
async fn launched_process_exports_kernel_environment() {
    use agent_kernel::kernel::launcher::{ENV_AGENT_ID, ENV_IPC_NAME};

    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("env.txt");
    let script = format!(
        "echo \"${ENV_AGENT_ID}:${ENV_IPC_NAME}\" > '{}'",
        out.display()
    );
    let args = vec!["-c".to_owned(), script];

    let mut launched = launcher()
        .launch(&LaunchSpec {
            agent_id: 17,
            parent_id: None,
            program: std::path::Path::new("/bin/sh"),
            args: &args,
            memory_max_bytes: None,
        })
        .await
        .expect("launch");

    assert!(launched.pid > 0);
    assert!(!launched.trampoline);
    let status = launched.child.wait().await.expect("wait");
    assert!(status.success());
    let written = std::fs::read_to_string(&out).expect("read env");
    assert_eq!(written.trim(), "17:launcher-test");
}

#[cfg(unix)]
#[tokio::test]
#[serial_test::serial]
async fn environment_is_filtered_through_allowlist() {
    std::env::set_var("AGENT_KERNEL_TEST_ALLOWED", "yes");
    std::env::set_var("AGENT_KERNEL_TEST_SECRET", "leak");

    let config = LaunchConfig {
        env_allowlist: vec!["AGENT_KERNEL_TEST_ALLOWED".into()],
        ..LaunchConfig::default()
    };
    let launcher = ProcessLauncher::new(config, CgroupManager::disabled(), "env-test".into());

    let dir = tempfile::tempdir().expect("tempdir");
    let out = dir.path().join("env.txt");
    let script = format!(
        "echo \"${{AGENT_KERNEL_TEST_ALLOWED}}:${{AGENT_KERNEL_TEST_SECRET}}\" > '{}'",
        out.display()
    );
    let args = vec!["-c".to_owned(), script];

    let mut launched = launcher
        .launch(&LaunchSpec {
            agent_id: 2,
            parent_id: Some(1),
            program: std::path::Path::new("/bin/sh"),
            args: &args,
            memory_max_bytes: None,
        })
        .await
        .expect("launch");
    launched.child.wait().await.expect("wait");

    std::env::remove_var("AGENT_KERNEL_TEST_ALLOWED");
    std::env::remove_var("AGENT_KERNEL_TEST_SECRET");

    let written = std::fs::read_to_string(&out).expect("read env");
    assert_eq!(written.trim(), "yes:");
}
