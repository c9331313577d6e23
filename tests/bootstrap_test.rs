//! Environment bootstrap driven by a fake toolchain installer script
//!
//! Run with: cargo test --test bootstrap_test
#![cfg(unix)]

use mediadeck_lib::binaries::{ArtifactKey, BinaryManager, MirrorCatalogs, MirrorSelector, Tool};
use mediadeck_lib::bootstrap::{BootstrapStep, EnvironmentBootstrap, PythonSettings};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const FAKE_INSTALLER: &str = r#"#!/bin/sh
here="$(dirname "$0")"
echo "$1 $2 index=${UV_DEFAULT_INDEX:-none}" >> "$here/calls.log"
if [ -f "$here/fail" ]; then
    echo "resolution failed" >&2
    exit 2
fi
case "$1" in
    venv)
        mkdir -p "$2/bin"
        printf '#!/bin/sh\n' > "$2/bin/python"
        chmod +x "$2/bin/python"
        ;;
esac
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    bootstrap: EnvironmentBootstrap,
    installer_dir: PathBuf,
    venv: PathBuf,
    lock: PathBuf,
}

impl Fixture {
    fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.installer_dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn syncs(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("pip sync")).count()
    }

    fn set_failing(&self) {
        std::fs::write(self.installer_dir.join("fail"), b"").unwrap();
    }
}

/// Bootstrap whose installer is already "installed" as a shell script
async fn fixture(in_region: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let manager = Arc::new(
        BinaryManager::new(
            root.join("binaries"),
            MirrorCatalogs::toolchain(),
            Arc::new(MirrorSelector::fixed(in_region)),
        )
        .unwrap(),
    );
    let key = ArtifactKey::current(Tool::ToolchainInstaller).expect("supported test platform");
    let descriptor = manager.resolve_version(&key).await.unwrap();
    let installer = manager.executable_path(&descriptor);
    write_executable(&installer, FAKE_INSTALLER);

    let project = root.join("server");
    std::fs::create_dir_all(&project).unwrap();
    let lock = project.join("requirements.lock");
    std::fs::write(&lock, "fastapi==0.110.0\n").unwrap();

    let venv = root.join("python").join(".venv");
    let bootstrap = EnvironmentBootstrap::new(manager, PythonSettings::default(), &venv, &project);

    Fixture {
        installer_dir: installer.parent().unwrap().to_path_buf(),
        _dir: dir,
        bootstrap,
        venv,
        lock,
    }
}

fn write_executable(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_run_all_prepares_environment_once() {
    let f = fixture(false).await;

    let status = f.bootstrap.status().await;
    assert!(status.installer_ready);
    assert!(!status.venv_ready);
    assert!(!status.dependencies_ready);

    f.bootstrap.run_all(None).await.unwrap();
    assert!(f.bootstrap.is_ready().await);
    assert!(f.bootstrap.python_path().is_file());
    assert_eq!(
        f.calls(),
        vec![
            format!("venv {} index=none", f.venv.display()),
            "pip sync index=none".to_string(),
        ]
    );

    // Nothing changed, nothing runs
    f.bootstrap.run_all(None).await.unwrap();
    assert_eq!(f.calls().len(), 2);
}

#[tokio::test]
async fn test_changed_lock_file_resyncs() {
    let f = fixture(false).await;
    f.bootstrap.run_all(None).await.unwrap();
    assert_eq!(f.syncs(), 1);

    std::fs::write(&f.lock, "fastapi==0.111.0\n").unwrap();
    assert!(!f.bootstrap.status().await.dependencies_ready);

    f.bootstrap.run_all(None).await.unwrap();
    assert_eq!(f.syncs(), 2);
    assert!(f.bootstrap.status().await.dependencies_ready);
}

#[tokio::test]
async fn test_invalidate_forces_step_again() {
    let f = fixture(false).await;
    f.bootstrap.run_all(None).await.unwrap();

    f.bootstrap.invalidate(BootstrapStep::Dependencies).await.unwrap();
    assert!(!f.bootstrap.status().await.dependencies_ready);
    f.bootstrap.run_step(BootstrapStep::Dependencies, None).await.unwrap();
    assert_eq!(f.syncs(), 2);

    f.bootstrap.invalidate(BootstrapStep::Venv).await.unwrap();
    let status = f.bootstrap.status().await;
    assert!(!status.venv_ready);
    assert!(!status.dependencies_ready);

    f.bootstrap.invalidate(BootstrapStep::Installer).await.unwrap();
    assert!(!f.bootstrap.status().await.installer_ready);
    assert!(f.bootstrap.installer_path().is_none());
}

#[tokio::test]
async fn test_failed_sync_reports_stderr_and_leaves_no_stamp() {
    let f = fixture(false).await;
    f.bootstrap.run_step(BootstrapStep::Venv, None).await.unwrap();
    f.set_failing();

    let err = f.bootstrap.install_dependencies().await.unwrap_err();
    assert_eq!(err.code(), "E_BOOTSTRAP_COMMAND");
    assert!(err.to_string().contains("resolution failed"), "{}", err);
    assert!(!f.bootstrap.status().await.dependencies_ready);
}

#[tokio::test]
async fn test_region_mirrors_reach_installer() {
    let f = fixture(true).await;
    f.bootstrap.run_all(None).await.unwrap();

    let index = PythonSettings::default().regional_index;
    for call in f.calls() {
        assert!(call.ends_with(&format!("index={index}")), "{}", call);
    }
}
