//! Command-line interface for analysis-forge.
//!
//! Provides commands to run, resume, validate and promote experiment runs,
//! and to inspect the runs of an experiment.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
