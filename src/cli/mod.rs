//! Command-line interface for queuectl.
//!
//! Provides commands for enqueueing jobs, running workers, inspecting the
//! queue and the dead letter queue, and managing configuration.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
