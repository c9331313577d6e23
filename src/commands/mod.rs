//! Command surface for the UI shell
pub mod binary_cmds;
pub mod bootstrap_cmds;
mod error;
pub mod sidecar_cmds;

pub use binary_cmds::*;
pub use bootstrap_cmds::*;
pub use error::CommandError;
pub use sidecar_cmds::*;
