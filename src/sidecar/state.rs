use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for SidecarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SidecarStatus::Stopped => "stopped",
            SidecarStatus::Starting => "starting",
            SidecarStatus::Running => "running",
            SidecarStatus::Stopping => "stopping",
            SidecarStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of the supervised process. `port` is set only while `running`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SidecarState {
    pub status: SidecarStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    /// Unix milliseconds
    pub started_at: Option<u64>,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub restart_attempts: u32,
    pub consecutive_health_failures: u32,
}

/// Notifications for UI listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarEvent {
    StatusChanged {
        status: SidecarStatus,
        error: Option<String>,
    },
    PortChanged {
        port: Option<u16>,
    },
    RestartScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    HealthCheckFailed {
        consecutive: u32,
        error: String,
    },
}
