//! Worker process spawning and lifecycle control.

mod command;
mod process;

pub use command::*;
pub use process::*;
