//! Command-line interface for forge-queue.
//!
//! Provides commands for inspecting queue sets and running a demo worker.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
