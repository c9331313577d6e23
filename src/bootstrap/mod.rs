mod environment;

pub use environment::{
    BootstrapError, BootstrapStatus, BootstrapStep, EnvironmentBootstrap, PythonSettings,
};
