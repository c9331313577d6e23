use super::CommandError;
use crate::binaries::{ArtifactKey, DownloadProgress, ProgressCallback, Tool};
use crate::state::AppState;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct BinaryStatus {
    pub key: ArtifactKey,
    pub installed: bool,
    pub path: Option<String>,
    /// Version the next acquisition would install
    pub version: Option<String>,
    pub task: Option<DownloadProgress>,
}

fn current_key(tool: Tool) -> Result<ArtifactKey, CommandError> {
    ArtifactKey::current(tool).ok_or_else(|| {
        CommandError::new(
            "E_UNSUPPORTED_PLATFORM",
            format!("{} is not available for this platform", tool),
        )
    })
}

/// Install `tool` for this machine unless it already is
pub async fn acquire_binary(
    state: &AppState,
    tool: Tool,
    on_progress: Option<ProgressCallback>,
) -> Result<String, CommandError> {
    let key = current_key(tool)?;
    let path = state.manager_for(tool).acquire(key, on_progress).await?;
    Ok(path.to_string_lossy().to_string())
}

/// Cancel the live download of `tool`, if any
pub fn cancel_binary(state: &AppState, tool: Tool) -> Result<bool, CommandError> {
    let key = current_key(tool)?;
    Ok(state.manager_for(tool).cancel(&key))
}

pub async fn remove_binary(state: &AppState, tool: Tool) -> Result<bool, CommandError> {
    let key = current_key(tool)?;
    Ok(state.manager_for(tool).remove(&key).await?)
}

pub async fn binary_status(state: &AppState, tool: Tool) -> Result<BinaryStatus, CommandError> {
    let key = current_key(tool)?;
    let manager = state.manager_for(tool);
    let path = manager.installed_path(&key);
    let version = manager.resolve_version(&key).await.ok().map(|d| d.version);

    Ok(BinaryStatus {
        key,
        installed: path.is_some(),
        path: path.map(|p| p.to_string_lossy().to_string()),
        version,
        task: manager.task(&key),
    })
}

/// Every live download across both managers
pub fn list_downloads(state: &AppState) -> Vec<DownloadProgress> {
    let mut tasks = state.media.tasks();
    tasks.extend(state.toolchain.tasks());
    tasks
}
