pub mod command;
pub mod error;

pub use command::{is_tool_installed, run_captured, CommandOutput, CommandSpec};
pub use error::{CoreError, Result};
