//! Command-line interface for disq.
//!
//! Provides commands for running worker pools, submitting tasks and
//! inspecting queues.

mod commands;

pub use commands::{parse_cli, run, run_with_apps, run_with_cli, Cli, Commands};
