//! CLI interface module
//!
//! Command definitions and handlers for the `engine` binary, and the terminal
//! output formatting (`comfy-table` or `--json`) shared across them.

pub mod commands;
pub mod output;

pub use commands::{Cli, Commands};
