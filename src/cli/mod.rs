//! Command-line interface for repro-bench.
//!
//! Provides commands for validating paper/task specifications and for
//! running single-paper or batch evaluations.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
