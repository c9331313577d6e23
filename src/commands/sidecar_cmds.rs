use super::CommandError;
use crate::sidecar::{SidecarConfig, SidecarEvent, SidecarState};
use crate::state::AppState;
use tokio::sync::broadcast;

/// Start the media server; `None` uses the configured sidecar settings.
/// Returns false if it is already starting or running.
pub async fn start_sidecar(
    state: &AppState,
    config: Option<SidecarConfig>,
) -> Result<bool, CommandError> {
    let config = config.unwrap_or_else(|| state.config.sidecar.clone());
    Ok(state.supervisor.start(config).await?)
}

pub async fn stop_sidecar(state: &AppState) -> Result<(), CommandError> {
    Ok(state.supervisor.stop().await?)
}

pub async fn restart_sidecar(state: &AppState) -> Result<bool, CommandError> {
    Ok(state.supervisor.restart().await?)
}

pub async fn sidecar_state(state: &AppState) -> SidecarState {
    state.supervisor.state().await
}

/// Status, port and health notifications
pub fn subscribe_sidecar(state: &AppState) -> broadcast::Receiver<SidecarEvent> {
    state.supervisor.subscribe()
}
