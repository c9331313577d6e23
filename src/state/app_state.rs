use crate::binaries::{
    AcquireError, BinaryManager, MirrorCatalogs, MirrorError, MirrorSelector, Tool,
};
use crate::bootstrap::EnvironmentBootstrap;
use crate::config::{AppConfig, AppPaths, ConfigError};
use crate::sidecar::{HttpHealthProbe, ManagedRuntime, SidecarError, SidecarSupervisor};
use std::sync::Arc;
use std::time::Duration;

/// Long-lived owner of every manager, built once per application run
pub struct AppState {
    pub paths: AppPaths,
    pub config: AppConfig,
    pub selector: Arc<MirrorSelector>,
    pub media: Arc<BinaryManager>,
    pub toolchain: Arc<BinaryManager>,
    pub bootstrap: Arc<EnvironmentBootstrap>,
    pub supervisor: SidecarSupervisor,
}

impl AppState {
    pub fn new(paths: AppPaths, config: AppConfig) -> Result<Self, StateError> {
        let selector = Arc::new(MirrorSelector::new(&config.mirror)?);
        Self::with_selector(paths, config, selector)
    }

    pub fn with_selector(
        paths: AppPaths,
        config: AppConfig,
        selector: Arc<MirrorSelector>,
    ) -> Result<Self, StateError> {
        paths.ensure()?;

        let media = Arc::new(BinaryManager::new(
            &paths.binaries,
            MirrorCatalogs::media(),
            Arc::clone(&selector),
        )?);
        let toolchain = Arc::new(BinaryManager::new(
            &paths.binaries,
            MirrorCatalogs::toolchain(),
            Arc::clone(&selector),
        )?);
        let bootstrap = Arc::new(EnvironmentBootstrap::new(
            Arc::clone(&toolchain),
            config.python.clone(),
            &paths.venv,
            &paths.server,
        ));

        let probe = HttpHealthProbe::new(
            config.supervisor.health_path.clone(),
            Duration::from_millis(config.supervisor.health_timeout_ms),
        )?;
        let runtime = ManagedRuntime::new(Arc::clone(&media), Arc::clone(&bootstrap));
        let supervisor = SidecarSupervisor::new(
            Arc::new(runtime),
            Arc::new(probe),
            config.supervisor.clone(),
            paths.clone(),
        );

        Ok(Self {
            paths,
            config,
            selector,
            media,
            toolchain,
            bootstrap,
            supervisor,
        })
    }

    /// Manager responsible for `tool`
    pub fn manager_for(&self, tool: Tool) -> &Arc<BinaryManager> {
        match tool {
            Tool::ToolchainInstaller => &self.toolchain,
            Tool::MediaTranscoder | Tool::MediaProber => &self.media,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
}
