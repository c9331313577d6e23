//! Archive extraction and executable lookup
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    TarXz,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(ArchiveKind::TarXz)
        } else {
            None
        }
    }
}

/// Unpack `archive` into `dest`, dispatching on the file extension.
/// Runs to completion once started; callers check cancellation before and after.
pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let name = archive.to_string_lossy().to_string();
    let kind = ArchiveKind::from_name(&name).ok_or(ExtractError::UnsupportedArchive(name))?;

    tokio::fs::create_dir_all(dest).await?;
    info!("Extracting {:?} ({:?}) into {:?}", archive, kind, dest);

    match kind {
        ArchiveKind::Zip => {
            let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
            tokio::task::spawn_blocking(move || extract_zip(&archive, &dest))
                .await
                .map_err(|e| ExtractError::Extract(e.to_string()))?
        }
        ArchiveKind::TarGz => {
            let (archive, dest) = (archive.to_path_buf(), dest.to_path_buf());
            tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &dest))
                .await
                .map_err(|e| ExtractError::Extract(e.to_string()))?
        }
        ArchiveKind::TarXz => extract_with_tar(archive, dest, "-xJf").await,
    }
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    use flate2::read::GzDecoder;
    use tar::Archive;

    let file = fs::File::open(archive)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest)
        .map_err(|e| ExtractError::Extract(e.to_string()))?;
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = fs::File::open(archive)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ExtractError::Extract(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ExtractError::Extract(e.to_string()))?;

        let outpath = match entry.enclosed_name() {
            Some(path) => dest.join(path),
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut outfile = fs::File::create(&outpath)?;
        std::io::copy(&mut entry, &mut outfile)
            .map_err(|e| ExtractError::Extract(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))?;
            }
        }
    }

    Ok(())
}

/// xz archives go through the system `tar`; a non-zero exit is a failure
async fn extract_with_tar(archive: &Path, dest: &Path, flags: &str) -> Result<(), ExtractError> {
    let output = Command::new("tar")
        .arg(flags)
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExtractError::Extract(format!("failed to run tar: {e}")))?;

    if !output.status.success() {
        return Err(ExtractError::CommandFailed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Translate a `*`/`?` path pattern into an anchored regex over `/`-separated paths
pub fn glob_to_regex(pattern: &str) -> Result<Regex, ExtractError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ExtractError::Pattern(e.to_string()))
}

pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Find the executable described by `pattern` under `root`
pub fn locate_executable(root: &Path, pattern: &str) -> Result<PathBuf, ExtractError> {
    if !has_wildcard(pattern) {
        let candidate = root.join(pattern);
        return if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(ExtractError::ExecutableMissing(pattern.to_string()))
        };
    }

    let matcher = glob_to_regex(pattern)?;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| ExtractError::Extract(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&relative) {
            return Ok(entry.into_path());
        }
    }

    Err(ExtractError::ExecutableMissing(pattern.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(String),
    #[error("Extraction failed: {0}")]
    Extract(String),
    #[error("Decompression exited with {code:?}: {stderr}")]
    CommandFailed { code: Option<i32>, stderr: String },
    #[error("Executable not found in archive: {0}")]
    ExecutableMissing(String),
    #[error("Invalid executable pattern: {0}")]
    Pattern(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
