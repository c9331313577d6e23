use crate::binaries::AcquireError;
use crate::bootstrap::BootstrapError;
use crate::config::ConfigError;
use crate::sidecar::SidecarError;
use serde::Serialize;

/// Error shape handed to the UI: a stable identifier plus a log-friendly message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: String,
    pub message: String,
}

impl CommandError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

macro_rules! from_coded {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for CommandError {
                fn from(e: $ty) -> Self {
                    CommandError::new(e.code(), e.to_string())
                }
            }
        )*
    };
}

from_coded!(AcquireError, BootstrapError, SidecarError, ConfigError);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binaries::{Arch, ArtifactKey, Platform, Tool};

    #[test]
    fn test_codes_carry_over() {
        let key = ArtifactKey::new(Tool::MediaProber, Platform::Linux, Arch::X64);
        let err: CommandError = AcquireError::Busy(key).into();
        assert_eq!(err.code, "E_BUSY");
        assert!(err.message.contains("media-prober-linux-x64"));

        let err: CommandError = SidecarError::CrashLoop(3).into();
        assert_eq!(err.code, "E_CRASH_LOOP");

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "E_CRASH_LOOP");
    }
}
