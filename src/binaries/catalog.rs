//! Built-in artifact catalogs for the default and regional mirrors
use super::types::{Arch, ArtifactDescriptor, ArtifactKey, Mirror, Platform, Tool};
use serde::{Deserialize, Serialize};

const FFMPEG_VERSION: &str = "7.0.2";
const UV_VERSION: &str = "0.5.11";

const REGION_BASE: &str = "https://registry.npmmirror.com/-/binary";

/// Flat list of descriptors for one mirror
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    entries: Vec<ArtifactDescriptor>,
}

impl Catalog {
    pub fn new(entries: Vec<ArtifactDescriptor>) -> Self {
        Self { entries }
    }

    pub fn builtin_default() -> Self {
        let mut entries = Vec::new();
        entries.extend(default_media_entries(Tool::MediaTranscoder, "ffmpeg"));
        entries.extend(default_media_entries(Tool::MediaProber, "ffprobe"));
        entries.extend(default_uv_entries());
        Self { entries }
    }

    pub fn builtin_region() -> Self {
        let mut entries = Vec::new();
        entries.extend(region_media_entries(Tool::MediaTranscoder, "ffmpeg"));
        entries.extend(region_media_entries(Tool::MediaProber, "ffprobe"));
        entries.extend(region_uv_entries());
        Self { entries }
    }

    pub fn find(&self, key: &ArtifactKey) -> Option<&ArtifactDescriptor> {
        self.entries.iter().find(|e| e.key() == *key)
    }

    pub fn entries(&self) -> &[ArtifactDescriptor] {
        &self.entries
    }

    /// Keep only the entries for the given tools
    pub fn for_tools(&self, tools: &[Tool]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|e| tools.contains(&e.tool))
                .cloned()
                .collect(),
        }
    }
}

/// The two catalogs a manager chooses between; they are never merged
#[derive(Debug, Clone, Default)]
pub struct MirrorCatalogs {
    pub default: Catalog,
    pub region: Catalog,
}

impl MirrorCatalogs {
    pub fn new(default: Catalog, region: Catalog) -> Self {
        Self { default, region }
    }

    /// Catalogs for the transcoder/prober manager
    pub fn media() -> Self {
        let tools = [Tool::MediaTranscoder, Tool::MediaProber];
        Self {
            default: Catalog::builtin_default().for_tools(&tools),
            region: Catalog::builtin_region().for_tools(&tools),
        }
    }

    /// Catalogs for the toolchain installer manager
    pub fn toolchain() -> Self {
        let tools = [Tool::ToolchainInstaller];
        Self {
            default: Catalog::builtin_default().for_tools(&tools),
            region: Catalog::builtin_region().for_tools(&tools),
        }
    }

    pub fn get(&self, mirror: Mirror) -> &Catalog {
        match mirror {
            Mirror::Default => &self.default,
            Mirror::Region => &self.region,
        }
    }
}

fn descriptor(
    tool: Tool,
    platform: Platform,
    arch: Arch,
    version: &str,
    url: String,
    size: u64,
    executable: String,
) -> ArtifactDescriptor {
    ArtifactDescriptor {
        tool,
        platform,
        arch,
        version: version.to_string(),
        url,
        size,
        sha256: None,
        executable,
    }
}

fn exe(name: &str, platform: Platform) -> String {
    match platform {
        Platform::Windows => format!("{name}.exe"),
        _ => name.to_string(),
    }
}

fn default_media_entries(tool: Tool, name: &str) -> Vec<ArtifactDescriptor> {
    let v = FFMPEG_VERSION;
    vec![
        descriptor(
            tool,
            Platform::Linux,
            Arch::X64,
            v,
            format!("https://johnvansickle.com/ffmpeg/releases/ffmpeg-{v}-amd64-static.tar.xz"),
            41_943_040,
            format!("ffmpeg-*-amd64-static/{name}"),
        ),
        descriptor(
            tool,
            Platform::Linux,
            Arch::Arm64,
            v,
            format!("https://johnvansickle.com/ffmpeg/releases/ffmpeg-{v}-arm64-static.tar.xz"),
            26_214_400,
            format!("ffmpeg-*-arm64-static/{name}"),
        ),
        descriptor(
            tool,
            Platform::Windows,
            Arch::X64,
            v,
            format!(
                "https://github.com/GyanD/codexffmpeg/releases/download/{v}/ffmpeg-{v}-essentials_build.zip"
            ),
            93_323_264,
            format!("ffmpeg-*-essentials_build/bin/{}", exe(name, Platform::Windows)),
        ),
        descriptor(
            tool,
            Platform::MacOs,
            Arch::X64,
            v,
            format!("https://evermeet.cx/ffmpeg/{name}-{v}.zip"),
            26_738_688,
            name.to_string(),
        ),
        descriptor(
            tool,
            Platform::MacOs,
            Arch::Arm64,
            v,
            format!("https://www.osxexperts.net/{name}{}arm.zip", v.replace('.', "")),
            24_117_248,
            name.to_string(),
        ),
    ]
}

fn region_media_entries(tool: Tool, name: &str) -> Vec<ArtifactDescriptor> {
    let v = FFMPEG_VERSION;
    let mut entries = Vec::new();
    for (platform, arch, archive, size) in [
        (Platform::Linux, Arch::X64, "linux-x64.tar.xz", 41_943_040),
        (Platform::Linux, Arch::Arm64, "linux-arm64.tar.xz", 26_214_400),
        (Platform::Windows, Arch::X64, "win32-x64.zip", 93_323_264),
        (Platform::MacOs, Arch::X64, "darwin-x64.zip", 26_738_688),
    ] {
        let executable = if archive.ends_with(".zip") {
            exe(name, platform)
        } else {
            format!("ffmpeg-{v}-*/{name}")
        };
        entries.push(descriptor(
            tool,
            platform,
            arch,
            v,
            format!("{REGION_BASE}/ffmpeg/{v}/ffmpeg-{v}-{archive}"),
            size,
            executable,
        ));
    }
    entries
}

fn uv_targets() -> [(Platform, Arch, &'static str, &'static str); 6] {
    [
        (Platform::Linux, Arch::X64, "x86_64-unknown-linux-gnu", "tar.gz"),
        (Platform::Linux, Arch::Arm64, "aarch64-unknown-linux-gnu", "tar.gz"),
        (Platform::MacOs, Arch::X64, "x86_64-apple-darwin", "tar.gz"),
        (Platform::MacOs, Arch::Arm64, "aarch64-apple-darwin", "tar.gz"),
        (Platform::Windows, Arch::X64, "x86_64-pc-windows-msvc", "zip"),
        (Platform::Windows, Arch::Arm64, "aarch64-pc-windows-msvc", "zip"),
    ]
}

fn uv_executable(platform: Platform, triple: &str) -> String {
    match platform {
        // Windows archives are flat
        Platform::Windows => exe("uv", platform),
        _ => format!("uv-{triple}/uv"),
    }
}

fn default_uv_entries() -> Vec<ArtifactDescriptor> {
    let v = UV_VERSION;
    uv_targets()
        .into_iter()
        .map(|(platform, arch, triple, ext)| {
            descriptor(
                Tool::ToolchainInstaller,
                platform,
                arch,
                v,
                format!("https://github.com/astral-sh/uv/releases/download/{v}/uv-{triple}.{ext}"),
                17_825_792,
                uv_executable(platform, triple),
            )
        })
        .collect()
}

fn region_uv_entries() -> Vec<ArtifactDescriptor> {
    let v = UV_VERSION;
    uv_targets()
        .into_iter()
        .map(|(platform, arch, triple, ext)| {
            descriptor(
                Tool::ToolchainInstaller,
                platform,
                arch,
                v,
                format!("{REGION_BASE}/uv/{v}/uv-{triple}.{ext}"),
                17_825_792,
                uv_executable(platform, triple),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_entries_match_their_key() {
        let catalog = Catalog::builtin_default();
        for entry in catalog.entries() {
            let found = catalog.find(&entry.key()).unwrap();
            assert_eq!(found.platform, entry.platform);
            assert_eq!(found.arch, entry.arch);
            assert_eq!(found.tool, entry.tool);
        }
    }

    #[test]
    fn test_keys_are_unique_per_catalog() {
        for catalog in [Catalog::builtin_default(), Catalog::builtin_region()] {
            let mut keys: Vec<_> = catalog.entries().iter().map(|e| e.key()).collect();
            let before = keys.len();
            keys.sort_by_key(|k| k.to_string());
            keys.dedup();
            assert_eq!(before, keys.len());
        }
    }

    #[test]
    fn test_executable_name_has_no_wildcard() {
        for entry in Catalog::builtin_default()
            .entries()
            .iter()
            .chain(Catalog::builtin_region().entries())
        {
            let name = entry.executable_name();
            assert!(!name.contains('*') && !name.contains('?'), "{}", entry.executable);
        }
    }

    #[test]
    fn test_windows_arm64_has_no_transcoder() {
        let key = ArtifactKey::new(Tool::MediaTranscoder, Platform::Windows, Arch::Arm64);
        assert!(Catalog::builtin_default().find(&key).is_none());
        assert!(Catalog::builtin_region().find(&key).is_none());
    }

    #[test]
    fn test_split_catalogs() {
        let media = MirrorCatalogs::media();
        assert!(media
            .default
            .entries()
            .iter()
            .all(|e| e.tool != Tool::ToolchainInstaller));
        let toolchain = MirrorCatalogs::toolchain();
        assert!(toolchain
            .region
            .entries()
            .iter()
            .all(|e| e.tool == Tool::ToolchainInstaller));
        assert_eq!(toolchain.default.entries().len(), 6);
    }
}
