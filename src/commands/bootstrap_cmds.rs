use super::CommandError;
use crate::binaries::ProgressCallback;
use crate::bootstrap::{BootstrapStatus, BootstrapStep};
use crate::state::AppState;

/// Run installer, venv and dependency steps in order
pub async fn run_bootstrap(
    state: &AppState,
    on_progress: Option<ProgressCallback>,
) -> Result<(), CommandError> {
    Ok(state.bootstrap.run_all(on_progress).await?)
}

pub async fn run_bootstrap_step(
    state: &AppState,
    step: BootstrapStep,
    on_progress: Option<ProgressCallback>,
) -> Result<(), CommandError> {
    Ok(state.bootstrap.run_step(step, on_progress).await?)
}

pub async fn invalidate_bootstrap_step(
    state: &AppState,
    step: BootstrapStep,
) -> Result<(), CommandError> {
    Ok(state.bootstrap.invalidate(step).await?)
}

pub async fn bootstrap_status(state: &AppState) -> BootstrapStatus {
    state.bootstrap.status().await
}
