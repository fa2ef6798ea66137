//! CLI module for the stackweave orchestrator.
//!
//! This module provides the command-line interface: argument parsing and
//! the text and JSON renderers for progress and results.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{DiffEntry, OutputFormatter, StatusEntry, status_color};
