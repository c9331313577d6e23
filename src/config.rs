//! Application configuration and on-disk layout
use crate::binaries::MirrorSettings;
use crate::bootstrap::PythonSettings;
use crate::sidecar::{SidecarConfig, SupervisorSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "mediadeck";
const CONFIG_FILE: &str = "config.json";
pub const DATA_DIR_ENV: &str = "MEDIADECK_DATA_DIR";

/// Every location the application writes to, derived from one data directory
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub binaries: PathBuf,
    pub venv: PathBuf,
    pub cache: PathBuf,
    pub sessions: PathBuf,
    pub server: PathBuf,
}

impl AppPaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            binaries: data_dir.join("binaries"),
            venv: data_dir.join("python").join(".venv"),
            cache: data_dir.join("cache"),
            sessions: data_dir.join("sessions"),
            server: data_dir.join("server"),
            data_dir,
        }
    }

    /// `MEDIADECK_DATA_DIR` if set, otherwise the platform data directory
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(dir)));
        }

        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or(ConfigError::NoDataDir)?;
        Ok(Self::new(base.join(APP_DIR)))
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn ensure(&self) -> Result<(), ConfigError> {
        for dir in [&self.binaries, &self.cache, &self.sessions, &self.server] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mirror: MirrorSettings,
    pub python: PythonSettings,
    pub supervisor: SupervisorSettings,
    /// Caller-supplied sidecar settings used at startup
    pub sidecar: SidecarConfig,
}

impl AppConfig {
    /// Read the config file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", path);
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if s.port_range_start > s.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} is empty",
                s.port_range_start, s.port_range_end
            )));
        }
        if s.port_candidates == 0 {
            return Err(ConfigError::Invalid("port_candidates must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine a data directory")]
    NoDataDir,
    #[error("Invalid config: {0}")]
    Invalid(String),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io(_) => "E_IO",
            _ => "E_CONFIG",
        }
    }
}
