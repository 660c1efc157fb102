//! Command-line interface for agent-validator.
//!
//! Provides commands for running a single agent pipeline, scoring peer
//! responses, and running the validator loop.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
