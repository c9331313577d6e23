use crate::binaries::download::sha256_file;
use crate::binaries::{AcquireError, ArtifactKey, BinaryManager, ProgressCallback, Tool};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const STAMP_FILE: &str = ".mediadeck-lock.sha256";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonSettings {
    /// Interpreter version requested from the toolchain installer
    pub version: String,
    pub server_module: String,
    /// Server project directory; defaults to `<data_dir>/server`
    pub project_dir: Option<PathBuf>,
    /// Lock file name inside the project directory
    pub lock_file: String,
    pub regional_index: String,
    pub regional_python_mirror: String,
}

impl Default for PythonSettings {
    fn default() -> Self {
        Self {
            version: "3.11".to_string(),
            server_module: "mediadeck_server".to_string(),
            project_dir: None,
            lock_file: "requirements.lock".to_string(),
            regional_index: "https://mirrors.aliyun.com/pypi/simple/".to_string(),
            regional_python_mirror:
                "https://registry.npmmirror.com/-/binary/python-build-standalone".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapStep {
    Installer,
    Venv,
    Dependencies,
}

impl BootstrapStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapStep::Installer => "installer",
            BootstrapStep::Venv => "venv",
            BootstrapStep::Dependencies => "dependencies",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapStatus {
    pub installer_ready: bool,
    pub venv_ready: bool,
    pub dependencies_ready: bool,
}

impl BootstrapStatus {
    pub fn is_ready(&self) -> bool {
        self.installer_ready && self.venv_ready && self.dependencies_ready
    }
}

/// Prepares the sidecar's Python environment:
/// installer acquisition, then virtual environment, then locked dependencies.
pub struct EnvironmentBootstrap {
    installer: Arc<BinaryManager>,
    installer_key: Option<ArtifactKey>,
    settings: PythonSettings,
    venv_dir: PathBuf,
    project_dir: PathBuf,
    running: Mutex<()>,
}

impl EnvironmentBootstrap {
    pub fn new(
        installer: Arc<BinaryManager>,
        settings: PythonSettings,
        venv_dir: impl Into<PathBuf>,
        default_project_dir: impl Into<PathBuf>,
    ) -> Self {
        let project_dir = settings
            .project_dir
            .clone()
            .unwrap_or_else(|| default_project_dir.into());

        Self {
            installer,
            installer_key: ArtifactKey::current(Tool::ToolchainInstaller),
            settings,
            venv_dir: venv_dir.into(),
            project_dir,
            running: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PythonSettings {
        &self.settings
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn python_path(&self) -> PathBuf {
        if cfg!(windows) {
            self.venv_dir.join("Scripts").join("python.exe")
        } else {
            self.venv_dir.join("bin").join("python")
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.project_dir.join(&self.settings.lock_file)
    }

    fn stamp_path(&self) -> PathBuf {
        self.venv_dir.join(STAMP_FILE)
    }

    fn installer_key(&self) -> Result<ArtifactKey, BootstrapError> {
        self.installer_key.ok_or(BootstrapError::UnsupportedPlatform)
    }

    /// Installed toolchain installer, without acquiring it
    pub fn installer_path(&self) -> Option<PathBuf> {
        self.installer_key
            .and_then(|key| self.installer.installed_path(&key))
    }

    pub async fn ensure_installer(
        &self,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, BootstrapError> {
        let key = self.installer_key()?;
        Ok(self.installer.acquire(key, on_progress).await?)
    }

    pub async fn ensure_venv(&self) -> Result<PathBuf, BootstrapError> {
        let python = self.python_path();
        if python.is_file() {
            return Ok(python);
        }

        let uv = self.require_installer()?;
        info!("Creating virtual environment at {:?}", self.venv_dir);
        if let Some(parent) = self.venv_dir.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut cmd = Command::new(uv);
        cmd.arg("venv")
            .arg(&self.venv_dir)
            .arg("--python")
            .arg(&self.settings.version);
        self.run(BootstrapStep::Venv, cmd).await?;

        if !python.is_file() {
            return Err(BootstrapError::Precondition(format!(
                "interpreter missing after venv creation: {:?}",
                python
            )));
        }
        Ok(python)
    }

    /// Sync the venv to the lock file. Skipped when the stamp matches the lock's digest.
    pub async fn install_dependencies(&self) -> Result<(), BootstrapError> {
        let python = self.python_path();
        if !python.is_file() {
            return Err(BootstrapError::Precondition(format!(
                "virtual environment missing: {:?}",
                self.venv_dir
            )));
        }
        let lock = self.lock_path();
        if !lock.is_file() {
            return Err(BootstrapError::Precondition(format!(
                "lock file missing: {:?}",
                lock
            )));
        }

        let digest = sha256_file(&lock).await?;
        if self.stamp_matches(&digest).await {
            info!("Dependencies already match {:?}", lock);
            return Ok(());
        }

        let uv = self.require_installer()?;
        info!("Installing dependencies from {:?}", lock);
        let mut cmd = Command::new(uv);
        cmd.arg("pip")
            .arg("sync")
            .arg(&lock)
            .arg("--python")
            .arg(&python);
        self.run(BootstrapStep::Dependencies, cmd).await?;

        fs::write(self.stamp_path(), &digest).await?;
        Ok(())
    }

    /// Run every step in order. A concurrent run is rejected.
    pub async fn run_all(&self, on_progress: Option<ProgressCallback>) -> Result<(), BootstrapError> {
        let _running = self.running.try_lock().map_err(|_| BootstrapError::Busy)?;

        self.ensure_installer(on_progress).await?;
        self.ensure_venv().await?;
        self.install_dependencies().await?;
        info!("Python environment ready");
        Ok(())
    }

    pub async fn run_step(
        &self,
        step: BootstrapStep,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), BootstrapError> {
        let _running = self.running.try_lock().map_err(|_| BootstrapError::Busy)?;

        match step {
            BootstrapStep::Installer => self.ensure_installer(on_progress).await.map(|_| ()),
            BootstrapStep::Venv => self.ensure_venv().await.map(|_| ()),
            BootstrapStep::Dependencies => self.install_dependencies().await,
        }
    }

    /// Drop a step's result so the next run redoes it
    pub async fn invalidate(&self, step: BootstrapStep) -> Result<(), BootstrapError> {
        let _running = self.running.try_lock().map_err(|_| BootstrapError::Busy)?;
        info!("Invalidating bootstrap step {}", step.as_str());

        match step {
            BootstrapStep::Installer => {
                let key = self.installer_key()?;
                self.installer.remove(&key).await?;
            }
            BootstrapStep::Venv => remove_dir_if_exists(&self.venv_dir).await?,
            BootstrapStep::Dependencies => match fs::remove_file(self.stamp_path()).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }
        Ok(())
    }

    pub async fn status(&self) -> BootstrapStatus {
        let dependencies_ready = match sha256_file(&self.lock_path()).await {
            Ok(digest) => self.stamp_matches(&digest).await,
            Err(_) => false,
        };

        BootstrapStatus {
            installer_ready: self.installer_path().is_some(),
            venv_ready: self.python_path().is_file(),
            dependencies_ready,
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.status().await.is_ready()
    }

    fn require_installer(&self) -> Result<PathBuf, BootstrapError> {
        self.installer_path().ok_or_else(|| {
            BootstrapError::Precondition("toolchain installer is not installed".to_string())
        })
    }

    async fn stamp_matches(&self, digest: &str) -> bool {
        match fs::read_to_string(self.stamp_path()).await {
            Ok(stamp) => stamp.trim() == digest,
            Err(_) => false,
        }
    }

    async fn run(&self, step: BootstrapStep, mut cmd: Command) -> Result<(), BootstrapError> {
        if self.installer.selector().prefers_region().await {
            cmd.env("UV_DEFAULT_INDEX", &self.settings.regional_index)
                .env("UV_PYTHON_INSTALL_MIRROR", &self.settings.regional_python_mirror);
        }

        let output = cmd
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BootstrapError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Bootstrap step {} failed: {}", step.as_str(), stderr);
            return Err(BootstrapError::Command {
                step,
                code: output.status.code(),
                stderr,
            });
        }

        Ok(())
    }
}

async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("No toolchain installer for this platform")]
    UnsupportedPlatform,
    #[error("Bootstrap already running")]
    Busy,
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Failed to run toolchain installer: {0}")]
    Spawn(String),
    #[error("Step {} exited with {code:?}: {stderr}", step.as_str())]
    Command {
        step: BootstrapStep,
        code: Option<i32>,
        stderr: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    pub fn code(&self) -> &'static str {
        match self {
            BootstrapError::UnsupportedPlatform => "E_UNSUPPORTED_PLATFORM",
            BootstrapError::Busy => "E_BUSY",
            BootstrapError::Acquire(e) => e.code(),
            BootstrapError::Precondition(_) => "E_PRECONDITION",
            BootstrapError::Spawn(_) | BootstrapError::Command { .. } => "E_BOOTSTRAP_COMMAND",
            BootstrapError::Io(_) => "E_IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::{MirrorCatalogs, MirrorSelector};

    fn bootstrap(root: &Path) -> EnvironmentBootstrap {
        let manager = BinaryManager::new(
            root.join("binaries"),
            MirrorCatalogs::toolchain(),
            Arc::new(MirrorSelector::fixed(false)),
        )
        .unwrap();
        EnvironmentBootstrap::new(
            Arc::new(manager),
            PythonSettings::default(),
            root.join("python").join(".venv"),
            root.join("server"),
        )
    }

    #[tokio::test]
    async fn test_fresh_status_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let b = bootstrap(dir.path());
        let status = b.status().await;
        assert!(!status.installer_ready);
        assert!(!status.venv_ready);
        assert!(!status.dependencies_ready);
        assert!(!b.is_ready().await);
    }

    #[tokio::test]
    async fn test_steps_require_previous_steps() {
        let dir = tempfile::tempdir().unwrap();
        let b = bootstrap(dir.path());

        let err = b.install_dependencies().await.unwrap_err();
        assert_eq!(err.code(), "E_PRECONDITION");

        // No network: venv creation must fail on the missing installer, not try to fetch it
        let err = b.ensure_venv().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_invalidate_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let b = bootstrap(dir.path());
        b.invalidate(BootstrapStep::Dependencies).await.unwrap();
        b.invalidate(BootstrapStep::Venv).await.unwrap();
    }

    #[test]
    fn test_project_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BinaryManager::new(
            dir.path(),
            MirrorCatalogs::toolchain(),
            Arc::new(MirrorSelector::fixed(false)),
        )
        .unwrap();
        let settings = PythonSettings {
            project_dir: Some(PathBuf::from("/srv/app")),
            ..Default::default()
        };
        let b = EnvironmentBootstrap::new(Arc::new(manager), settings, "/v", "/unused");
        assert_eq!(b.project_dir(), Path::new("/srv/app"));
        assert_eq!(b.lock_path(), PathBuf::from("/srv/app/requirements.lock"));
    }
}
