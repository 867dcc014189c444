//! Command-line interface for swe-farm.
//!
//! Provides the `farm`, `validate` and `clean` commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
