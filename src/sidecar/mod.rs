mod config;
mod health;
mod port;
mod runtime;
mod state;
mod supervisor;

pub use config::{SidecarConfig, SupervisorSettings, DEFAULT_HOST, DEFAULT_LOG_LEVEL};
pub use health::{HealthProbe, HttpHealthProbe};
pub use port::{allocate_port, is_port_free};
pub use runtime::{ManagedRuntime, SidecarRuntime};
pub use state::{SidecarEvent, SidecarState, SidecarStatus};
pub use supervisor::SidecarSupervisor;

use crate::binaries::{AcquireError, Tool};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("No free port in {start}..={end}")]
    PortExhausted { start: u16, end: u16 },
    #[error("Sidecar did not become healthy within {0:?}")]
    StartupTimeout(Duration),
    #[error("Failed to launch sidecar: {0}")]
    LaunchFailed(String),
    #[error("Sidecar crashed {0} times in a row, giving up")]
    CrashLoop(u32),
    #[error("Precondition failed: {0}")]
    Precondition(String),
    #[error("Sidecar is busy with another lifecycle operation")]
    Busy,
    #[error("No {0} available for this platform")]
    UnsupportedPlatform(Tool),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error("HTTP client error: {0}")]
    Http(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SidecarError {
    pub fn code(&self) -> &'static str {
        match self {
            SidecarError::PortExhausted { .. } => "E_PORT_EXHAUSTED",
            SidecarError::StartupTimeout(_) => "E_STARTUP_TIMEOUT",
            SidecarError::LaunchFailed(_) => "E_LAUNCH_FAILED",
            SidecarError::CrashLoop(_) => "E_CRASH_LOOP",
            SidecarError::Precondition(_) => "E_PRECONDITION",
            SidecarError::Busy => "E_BUSY",
            SidecarError::UnsupportedPlatform(_) => "E_UNSUPPORTED_PLATFORM",
            SidecarError::Acquire(e) => e.code(),
            SidecarError::Http(_) => "E_NETWORK",
            SidecarError::Io(_) => "E_IO",
        }
    }
}
