//! debug-mcp wrapper - keeps a leak-prone stdio worker fresh without dropping input.
//!
//! The [`proxy::Supervisor`] sits between a client's byte stream and a worker
//! process, replacing the worker on a timer or after a crash while buffering
//! client input that arrives mid-swap.

pub mod config;
pub mod proxy;
pub mod worker;
