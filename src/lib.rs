//! Multi-process test monitor.
//!
//! Launches the child processes described by a scenario, polls them to
//! completion (or indefinitely, for processes expected to never end),
//! detects and collects crash diagnostics, enforces runtime limits, and
//! judges every process against its expected-outcome contract.

pub mod app;
pub mod config;
pub mod dumps;
pub mod helpers;
pub mod logger;
pub mod monitor;
pub mod platform;
mod prelude;
pub mod process;
pub mod report;
pub mod terminator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
