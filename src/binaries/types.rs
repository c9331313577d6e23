use serde::{Deserialize, Serialize};
use std::fmt;

/// External executables managed by the acquisition layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    MediaTranscoder,
    MediaProber,
    ToolchainInstaller,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::MediaTranscoder => "media-transcoder",
            Tool::MediaProber => "media-prober",
            Tool::ToolchainInstaller => "toolchain-installer",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    #[serde(rename = "macos")]
    MacOs,
    Linux,
}

impl Platform {
    /// Platform this build targets, if supported
    pub fn current() -> Option<Self> {
        #[cfg(target_os = "windows")]
        return Some(Platform::Windows);
        #[cfg(target_os = "macos")]
        return Some(Platform::MacOs);
        #[cfg(target_os = "linux")]
        return Some(Platform::Linux);

        #[allow(unreachable_code)]
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn current() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        return Some(Arch::X64);
        #[cfg(target_arch = "aarch64")]
        return Some(Arch::Arm64);

        #[allow(unreachable_code)]
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one acquisition: at most one live download exists per key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub tool: Tool,
    pub platform: Platform,
    pub arch: Arch,
}

impl ArtifactKey {
    pub fn new(tool: Tool, platform: Platform, arch: Arch) -> Self {
        Self {
            tool,
            platform,
            arch,
        }
    }

    /// Key for the host running this process
    pub fn current(tool: Tool) -> Option<Self> {
        Some(Self::new(tool, Platform::current()?, Arch::current()?))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.tool, self.platform, self.arch)
    }
}

/// Which catalog a descriptor came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mirror {
    Default,
    Region,
}

/// One downloadable build of a tool for a platform/arch pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub tool: Tool,
    pub platform: Platform,
    pub arch: Arch,
    pub version: String,
    pub url: String,
    /// Expected compressed size in bytes, used when the server sends no Content-Length
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    /// Path of the executable inside the extracted archive; may contain `*`/`?` segments
    pub executable: String,
}

impl ArtifactDescriptor {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.tool, self.platform, self.arch)
    }

    pub fn install_dir_name(&self) -> String {
        format!("{}-{}-{}", self.version, self.platform, self.arch)
    }

    /// File name the executable gets in the installed directory
    pub fn executable_name(&self) -> &str {
        self.executable
            .rsplit('/')
            .next()
            .unwrap_or(self.executable.as_str())
    }

    pub fn archive_name(&self) -> String {
        let name = self.url.rsplit('/').next().unwrap_or("artifact.bin");
        let name = name.split('?').next().unwrap_or(name);
        if name.is_empty() {
            "artifact.bin".to_string()
        } else {
            name.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Extracting,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

/// Snapshot of a live download task, handed to progress callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub key: ArtifactKey,
    pub percent: f64,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes per second over the last second
    pub speed: f64,
    pub eta_secs: Option<u64>,
    pub status: DownloadStatus,
}

impl DownloadProgress {
    pub fn new(key: ArtifactKey) -> Self {
        Self {
            key,
            percent: 0.0,
            downloaded: 0,
            total: None,
            speed: 0.0,
            eta_secs: None,
            status: DownloadStatus::Downloading,
        }
    }
}
