pub mod binaries;
pub mod bootstrap;
pub mod commands;
pub mod config;
pub mod sidecar;
pub mod state;

use anyhow::Context;
use binaries::{DownloadProgress, DownloadStatus, ProgressCallback};
use config::{AppConfig, AppPaths};
use sidecar::SidecarEvent;
use state::AppState;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Headless entry point: prepare the toolchain, run the media server until
/// Ctrl-C, then shut it down.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let paths = AppPaths::resolve()?;
    let config = AppConfig::load(&paths.config_file()).context("loading config")?;
    info!("Data directory: {:?}", paths.data_dir);

    let state = Arc::new(AppState::new(paths, config)?);
    state.selector.prewarm();

    let progress: ProgressCallback = Arc::new(log_progress);
    commands::run_bootstrap(&state, Some(Arc::clone(&progress)))
        .await
        .context("bootstrapping python environment")?;

    let mut events = commands::subscribe_sidecar(&state);
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SidecarEvent::PortChanged { port } => info!("Sidecar port: {:?}", port),
                SidecarEvent::RestartScheduled { attempt, delay_ms } => {
                    warn!("Sidecar restart {} in {} ms", attempt, delay_ms)
                }
                _ => {}
            }
        }
    });

    commands::start_sidecar(&state, None)
        .await
        .context("starting sidecar")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    commands::stop_sidecar(&state).await?;
    Ok(())
}

fn log_progress(progress: &DownloadProgress) {
    match progress.status {
        DownloadStatus::Downloading => info!(
            "{}: {:.1}% ({} bytes, {:.0} B/s)",
            progress.key, progress.percent, progress.downloaded, progress.speed
        ),
        status => info!("{}: {:?}", progress.key, status),
    }
}
