//! Binary acquisition: resolve, download, verify, extract and install artifacts
use super::catalog::MirrorCatalogs;
use super::download::{sha256_file, DownloadError, Downloader, TransferProgress};
use super::extract::{extract_archive, locate_executable, ExtractError};
use super::mirror::MirrorSelector;
use super::types::{
    ArtifactDescriptor, ArtifactKey, DownloadProgress, DownloadStatus, Mirror, Platform,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub type ProgressCallback = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

struct LiveTask {
    id: Uuid,
    cancel: CancellationToken,
    progress: DownloadProgress,
}

/// Manages one family of external binaries under `<root>/<tool>/...`
pub struct BinaryManager {
    root: PathBuf,
    catalogs: MirrorCatalogs,
    selector: Arc<MirrorSelector>,
    downloader: Downloader,
    tasks: DashMap<ArtifactKey, LiveTask>,
}

impl BinaryManager {
    pub fn new(
        root: impl Into<PathBuf>,
        catalogs: MirrorCatalogs,
        selector: Arc<MirrorSelector>,
    ) -> Result<Self, AcquireError> {
        Ok(Self {
            root: root.into(),
            catalogs,
            selector,
            downloader: Downloader::new()?,
            tasks: DashMap::new(),
        })
    }

    pub fn selector(&self) -> &Arc<MirrorSelector> {
        &self.selector
    }

    /// Pick the descriptor for `key`: the region mirror when preferred and
    /// defined, otherwise the default mirror
    pub async fn resolve_version(&self, key: &ArtifactKey) -> Result<ArtifactDescriptor, AcquireError> {
        self.resolve(key).await.map(|(_, d)| d)
    }

    async fn resolve(&self, key: &ArtifactKey) -> Result<(Mirror, ArtifactDescriptor), AcquireError> {
        if self.selector.prefers_region().await {
            if let Some(d) = self.catalogs.region.find(key) {
                return Ok((Mirror::Region, d.clone()));
            }
        }

        self.catalogs
            .default
            .find(key)
            .map(|d| (Mirror::Default, d.clone()))
            .ok_or(AcquireError::UnsupportedPlatform(*key))
    }

    pub fn install_dir(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.root
            .join(descriptor.tool.as_str())
            .join(descriptor.install_dir_name())
    }

    pub fn executable_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.install_dir(descriptor).join(descriptor.executable_name())
    }

    fn temp_dir(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.tool.as_str())
            .join(".temp")
            .join(key.to_string())
    }

    /// Descriptors from both mirrors; an install from either counts
    fn candidates(&self, key: &ArtifactKey) -> Vec<&ArtifactDescriptor> {
        [Mirror::Region, Mirror::Default]
            .into_iter()
            .filter_map(|m| self.catalogs.get(m).find(key))
            .collect()
    }

    /// Path of the installed executable, if it exists as a regular file
    pub fn installed_path(&self, key: &ArtifactKey) -> Option<PathBuf> {
        self.candidates(key)
            .into_iter()
            .map(|d| self.executable_path(d))
            .find(|p| p.is_file())
    }

    pub fn is_installed(&self, key: &ArtifactKey) -> bool {
        self.installed_path(key).is_some()
    }

    /// Snapshot of the live download for `key`
    pub fn task(&self, key: &ArtifactKey) -> Option<DownloadProgress> {
        self.tasks.get(key).map(|t| t.progress.clone())
    }

    pub fn tasks(&self) -> Vec<DownloadProgress> {
        self.tasks.iter().map(|t| t.progress.clone()).collect()
    }

    /// Signal cancellation of the live download for `key`. Returns false if none is live.
    pub fn cancel(&self, key: &ArtifactKey) -> bool {
        match self.tasks.get(key) {
            Some(task) => {
                info!("Cancelling download {}", key);
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete installed directories for `key`. Returns whether anything was removed.
    pub async fn remove(&self, key: &ArtifactKey) -> Result<bool, AcquireError> {
        let mut removed = false;
        for descriptor in self.candidates(key) {
            let dir = self.install_dir(descriptor);
            if fs::metadata(&dir).await.is_ok() {
                fs::remove_dir_all(&dir).await?;
                info!("Removed {:?}", dir);
                removed = true;
            }
        }
        Ok(removed)
    }

    /// Install the artifact for `key` unless it already is.
    ///
    /// A second call for a key with a live download is rejected with
    /// [`AcquireError::Busy`]; it is never queued.
    pub async fn acquire(
        &self,
        key: ArtifactKey,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PathBuf, AcquireError> {
        if let Some(path) = self.installed_path(&key) {
            info!("Using installed binary: {:?}", path);
            return Ok(path);
        }

        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        match self.tasks.entry(key) {
            Entry::Occupied(_) => {
                warn!("Rejecting acquisition of {}: download already in flight", key);
                return Err(AcquireError::Busy(key));
            }
            Entry::Vacant(slot) => {
                slot.insert(LiveTask {
                    id,
                    cancel: token.clone(),
                    progress: DownloadProgress::new(key),
                });
            }
        }
        let _guard = TaskGuard {
            tasks: &self.tasks,
            key,
            id,
        };
        let reporter = Reporter {
            tasks: &self.tasks,
            key,
            id,
            callback: on_progress,
        };

        // Another acquisition may have finished between the check and the insert
        if let Some(path) = self.installed_path(&key) {
            reporter.update(|p| {
                p.status = DownloadStatus::Completed;
                p.percent = 100.0;
            });
            return Ok(path);
        }

        let result = self.acquire_with_fallback(&key, &token, &reporter).await;
        match &result {
            Ok(path) => {
                info!("Installed {} at {:?}", key, path);
                reporter.update(|p| {
                    p.status = DownloadStatus::Completed;
                    p.percent = 100.0;
                    p.eta_secs = Some(0);
                });
            }
            Err(e) if e.is_cancelled() => {
                info!("Acquisition of {} cancelled", key);
                reporter.update(|p| p.status = DownloadStatus::Cancelled);
            }
            Err(e) => {
                warn!("Acquisition of {} failed: {}", key, e);
                reporter.update(|p| p.status = DownloadStatus::Error);
            }
        }
        result
    }

    async fn acquire_with_fallback(
        &self,
        key: &ArtifactKey,
        token: &CancellationToken,
        reporter: &Reporter<'_>,
    ) -> Result<PathBuf, AcquireError> {
        let (mirror, primary) = self.resolve(key).await?;

        match self.install(&primary, token, reporter).await {
            Err(e) if mirror == Mirror::Region && !e.is_cancelled() => {
                let Some(fallback) = self.catalogs.default.find(key) else {
                    return Err(e);
                };
                warn!(
                    "Region mirror failed for {} ({}), retrying default mirror",
                    key, e
                );
                self.install(fallback, token, reporter).await
            }
            other => other,
        }
    }

    async fn install(
        &self,
        descriptor: &ArtifactDescriptor,
        token: &CancellationToken,
        reporter: &Reporter<'_>,
    ) -> Result<PathBuf, AcquireError> {
        let temp_dir = self.temp_dir(&descriptor.key());
        let result = self.install_in(descriptor, &temp_dir, token, reporter).await;

        if let Err(e) = fs::remove_dir_all(&temp_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean temp dir {:?}: {}", temp_dir, e);
            }
        }

        result
    }

    async fn install_in(
        &self,
        descriptor: &ArtifactDescriptor,
        temp_dir: &Path,
        token: &CancellationToken,
        reporter: &Reporter<'_>,
    ) -> Result<PathBuf, AcquireError> {
        check_cancelled(token)?;
        if fs::metadata(temp_dir).await.is_ok() {
            fs::remove_dir_all(temp_dir).await?;
        }
        fs::create_dir_all(temp_dir).await?;

        reporter.update(|p| {
            *p = DownloadProgress::new(p.key);
        });

        let archive = temp_dir.join(descriptor.archive_name());
        info!(
            "Downloading {} v{} from {}",
            descriptor.key(),
            descriptor.version,
            descriptor.url
        );
        self.downloader
            .fetch(
                &descriptor.url,
                &archive,
                descriptor.size,
                token,
                &mut |t: TransferProgress| {
                    reporter.update(|p| {
                        p.downloaded = t.downloaded;
                        p.total = t.total;
                        p.speed = t.speed;
                        p.percent = t.percent();
                        p.eta_secs = t.eta_secs();
                    })
                },
            )
            .await?;

        if let Some(expected) = descriptor.sha256.as_deref() {
            check_cancelled(token)?;
            reporter.update(|p| p.status = DownloadStatus::Verifying);
            let actual = sha256_file(&archive).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(AcquireError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        check_cancelled(token)?;
        reporter.update(|p| p.status = DownloadStatus::Extracting);
        let extract_dir = temp_dir.join("extracted");
        extract_archive(&archive, &extract_dir).await?;
        let source = locate_executable(&extract_dir, &descriptor.executable)?;

        check_cancelled(token)?;
        self.place(descriptor, &source).await
    }

    /// Copy the executable into its version directory
    async fn place(
        &self,
        descriptor: &ArtifactDescriptor,
        source: &Path,
    ) -> Result<PathBuf, AcquireError> {
        let install_dir = self.install_dir(descriptor);
        fs::create_dir_all(&install_dir).await?;

        let target = install_dir.join(descriptor.executable_name());
        let staging = install_dir.join(format!(".{}.partial", descriptor.executable_name()));
        fs::copy(source, &staging).await?;

        #[cfg(unix)]
        if descriptor.platform != Platform::Windows {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&staging).await?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&staging, perms).await?;
        }

        fs::rename(&staging, &target).await?;
        Ok(target)
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<(), AcquireError> {
    if token.is_cancelled() {
        Err(AcquireError::Cancelled)
    } else {
        Ok(())
    }
}

/// Removes the live task entry however the acquisition ends
struct TaskGuard<'a> {
    tasks: &'a DashMap<ArtifactKey, LiveTask>,
    key: ArtifactKey,
    id: Uuid,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.tasks.remove_if(&self.key, |_, task| task.id == self.id);
    }
}

/// Writes progress into the live task and forwards a snapshot to the caller
struct Reporter<'a> {
    tasks: &'a DashMap<ArtifactKey, LiveTask>,
    key: ArtifactKey,
    id: Uuid,
    callback: Option<ProgressCallback>,
}

impl Reporter<'_> {
    fn update(&self, apply: impl FnOnce(&mut DownloadProgress)) {
        let snapshot = {
            let Some(mut task) = self.tasks.get_mut(&self.key) else {
                return;
            };
            if task.id != self.id {
                return;
            }
            apply(&mut task.progress);
            task.progress.clone()
        };

        // The map guard is released before user code runs
        if let Some(callback) = &self.callback {
            callback(&snapshot);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("No artifact for {0}")]
    UnsupportedPlatform(ArtifactKey),
    #[error("Acquisition of {0} is already in progress")]
    Busy(ArtifactKey),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Acquisition cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquireError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            AcquireError::Cancelled | AcquireError::Download(DownloadError::Cancelled)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            AcquireError::UnsupportedPlatform(_) => "E_UNSUPPORTED_PLATFORM",
            AcquireError::Busy(_) => "E_BUSY",
            AcquireError::Download(DownloadError::Cancelled) | AcquireError::Cancelled => {
                "E_CANCELLED"
            }
            AcquireError::Download(DownloadError::TooManyRedirects(_)) => "E_TOO_MANY_REDIRECTS",
            AcquireError::Download(DownloadError::Status(_)) => "E_HTTP_STATUS",
            AcquireError::Download(DownloadError::Io(_)) => "E_IO",
            AcquireError::Download(_) => "E_NETWORK",
            AcquireError::Extract(ExtractError::ExecutableMissing(_)) => "E_EXECUTABLE_MISSING",
            AcquireError::Extract(_) => "E_EXTRACTION",
            AcquireError::ChecksumMismatch { .. } => "E_CHECKSUM_MISMATCH",
            AcquireError::Io(_) => "E_IO",
        }
    }
}
