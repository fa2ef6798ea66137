//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackweave - dependency-ordered deploys of `CloudFormation` stack graphs.
#[derive(Parser, Debug)]
#[command(name = "stackweave")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the manifest and the stack graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Deploy stacks in dependency order.
    Deploy {
        /// Deploy only these stacks and what they depend on.
        #[arg(short, long = "stack", value_name = "NAME")]
        stacks: Vec<String>,

        /// Deploy even when nothing changed.
        #[arg(short, long)]
        force: bool,
    },

    /// Remove stacks in reverse dependency order.
    Remove {
        /// Remove only these stacks and what depends on them.
        #[arg(short, long = "stack", value_name = "NAME")]
        stacks: Vec<String>,
    },

    /// Show which stacks a deploy would change.
    Diff {
        /// Compare only these stacks.
        #[arg(short, long = "stack", value_name = "NAME")]
        stacks: Vec<String>,
    },

    /// Show the live status of every stack.
    Status,

    /// Inspect or repair the run record.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Run-record subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the run record.
    Show,

    /// Remove a lock left behind by an interrupted run.
    Unlock {
        /// Lock ID to release; without it the lock is removed regardless of
        /// its holder.
        #[arg(long)]
        lock_id: Option<String>,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_with_stack_selection() {
        let cli = Cli::try_parse_from([
            "stackweave", "deploy", "--stack", "api", "-s", "web", "--force",
        ])
        .expect("valid arguments");

        let Commands::Deploy { stacks, force } = cli.command else {
            panic!("expected deploy");
        };
        assert_eq!(stacks, vec!["api", "web"]);
        assert!(force);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stackweave", "status", "--output", "json", "-c", "infra/stackweave.yaml",
        ])
        .expect("valid arguments");

        assert!(matches!(cli.output, OutputFormat::Json));
        assert_eq!(cli.config, Some(PathBuf::from("infra/stackweave.yaml")));
    }

    #[test]
    fn test_state_unlock() {
        let cli = Cli::try_parse_from(["stackweave", "state", "unlock"]).expect("valid arguments");
        assert!(matches!(
            cli.command,
            Commands::State { command: StateCommands::Unlock { lock_id: None } }
        ));
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
