use crate::config::AppPaths;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_LOG_LEVEL: &str = "info";
const ENV_PREFIX: &str = "MEDIADECK_";

/// Settings handed to the media server. Every field is optional; only the
/// ones that are set reach the process environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub host: Option<String>,
    /// Preferred port; another one from the range is used if it is taken
    pub port: Option<u16>,
    pub log_level: Option<String>,
    pub debug: Option<bool>,
    pub cache_dir: Option<PathBuf>,
    pub session_dir: Option<PathBuf>,
    pub hls_segment_seconds: Option<u32>,
    pub hls_list_size: Option<u32>,
    pub max_concurrent_transcodes: Option<u32>,
    pub max_concurrent_probes: Option<u32>,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub hw_accel: Option<String>,
    pub transcode_preset: Option<String>,
    pub transcode_threads: Option<u32>,
    pub hybrid_enabled: Option<bool>,
    pub hybrid_direct_play: Option<bool>,
}

impl SidecarConfig {
    /// Fill host, log level and the cache/session roots where unset
    pub fn with_defaults(mut self, paths: &AppPaths) -> Self {
        self.host.get_or_insert_with(|| DEFAULT_HOST.to_string());
        self.log_level
            .get_or_insert_with(|| DEFAULT_LOG_LEVEL.to_string());
        self.cache_dir.get_or_insert_with(|| paths.cache.clone());
        self.session_dir.get_or_insert_with(|| paths.sessions.clone());
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    /// Environment for a process bound to `port`
    pub fn to_env(&self, port: u16) -> Vec<(String, String)> {
        let mut env = EnvBuilder::default();
        env.set("HOST", Some(self.host()));
        env.set("PORT", Some(port));
        env.set("LOG_LEVEL", self.log_level.as_ref());
        env.set("DEBUG", self.debug);
        env.set_path("CACHE_DIR", &self.cache_dir);
        env.set_path("SESSION_DIR", &self.session_dir);
        env.set("HLS_SEGMENT_SECONDS", self.hls_segment_seconds);
        env.set("HLS_LIST_SIZE", self.hls_list_size);
        env.set("MAX_CONCURRENT_TRANSCODES", self.max_concurrent_transcodes);
        env.set("MAX_CONCURRENT_PROBES", self.max_concurrent_probes);
        env.set_path("FFMPEG_PATH", &self.ffmpeg_path);
        env.set_path("FFPROBE_PATH", &self.ffprobe_path);
        env.set("HW_ACCEL", self.hw_accel.as_ref());
        env.set("TRANSCODE_PRESET", self.transcode_preset.as_ref());
        env.set("TRANSCODE_THREADS", self.transcode_threads);
        env.set("HYBRID_ENABLED", self.hybrid_enabled);
        env.set("HYBRID_DIRECT_PLAY", self.hybrid_direct_play);
        env.vars
    }
}

#[derive(Default)]
struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    fn set(&mut self, name: &str, value: Option<impl ToString>) {
        if let Some(value) = value {
            self.vars
                .push((format!("{ENV_PREFIX}{name}"), value.to_string()));
        }
    }

    fn set_path(&mut self, name: &str, value: &Option<PathBuf>) {
        self.set(name, value.as_ref().map(|p| p.to_string_lossy()));
    }
}

/// Timing and retry policy of the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub startup_timeout_ms: u64,
    pub startup_poll_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub health_path: String,
    pub shutdown_grace_ms: u64,
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,
    /// A crash after this much uptime starts a fresh restart budget
    pub stable_after_ms: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_candidates: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 10_000,
            startup_poll_ms: 250,
            health_interval_ms: 5_000,
            health_timeout_ms: 2_000,
            health_path: "/api/v1/health".to_string(),
            shutdown_grace_ms: 5_000,
            max_restarts: 3,
            restart_backoff_ms: 1_000,
            stable_after_ms: 60_000,
            port_range_start: 8765,
            port_range_end: 8864,
            port_candidates: 50,
        }
    }
}

impl SupervisorSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }

    /// Linear backoff: `attempt` × base
    pub fn restart_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.restart_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}
