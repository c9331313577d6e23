use super::{SidecarConfig, SidecarError};
use crate::binaries::{ArtifactKey, BinaryManager, Tool};
use crate::bootstrap::EnvironmentBootstrap;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tracing::info;

/// Where the supervisor gets its binaries, preconditions and launch command
#[async_trait]
pub trait SidecarRuntime: Send + Sync {
    /// Fill binary paths the caller left unset
    async fn resolve_binaries(&self, config: &mut SidecarConfig) -> Result<(), SidecarError>;

    /// Existence checks only; nothing is installed here
    async fn check_preconditions(&self) -> Result<(), SidecarError>;

    /// Program, arguments and working directory. The supervisor adds env and stdio.
    fn command(&self, config: &SidecarConfig) -> Result<Command, SidecarError>;
}

/// Runs the Python media server from the bootstrapped environment with
/// transcoder/prober binaries from the media manager
pub struct ManagedRuntime {
    media: Arc<BinaryManager>,
    bootstrap: Arc<EnvironmentBootstrap>,
}

impl ManagedRuntime {
    pub fn new(media: Arc<BinaryManager>, bootstrap: Arc<EnvironmentBootstrap>) -> Self {
        Self { media, bootstrap }
    }

    async fn binary(&self, tool: Tool) -> Result<PathBuf, SidecarError> {
        let key = ArtifactKey::current(tool).ok_or(SidecarError::UnsupportedPlatform(tool))?;
        let path = self.media.acquire(key, None).await?;
        info!("Resolved {} at {:?}", tool, path);
        Ok(path)
    }
}

#[async_trait]
impl SidecarRuntime for ManagedRuntime {
    async fn resolve_binaries(&self, config: &mut SidecarConfig) -> Result<(), SidecarError> {
        if config.ffmpeg_path.is_none() {
            config.ffmpeg_path = Some(self.binary(Tool::MediaTranscoder).await?);
        }
        if config.ffprobe_path.is_none() {
            config.ffprobe_path = Some(self.binary(Tool::MediaProber).await?);
        }
        Ok(())
    }

    async fn check_preconditions(&self) -> Result<(), SidecarError> {
        if self.bootstrap.installer_path().is_none() {
            return Err(SidecarError::Precondition(
                "toolchain installer is not installed".to_string(),
            ));
        }
        let python = self.bootstrap.python_path();
        if !python.is_file() {
            return Err(SidecarError::Precondition(format!(
                "python environment missing: {:?}",
                python
            )));
        }
        Ok(())
    }

    fn command(&self, _config: &SidecarConfig) -> Result<Command, SidecarError> {
        let mut cmd = Command::new(self.bootstrap.python_path());
        cmd.arg("-m")
            .arg(&self.bootstrap.settings().server_module)
            .current_dir(self.bootstrap.project_dir());
        Ok(cmd)
    }
}
