//! Restart coordination: the supervisor, its replay buffer and state machine.

mod backoff;
mod buffer;
mod runner;
mod state;

pub use backoff::*;
pub use buffer::*;
pub use runner::*;
pub use state::*;
