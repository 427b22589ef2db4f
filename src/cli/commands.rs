//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - validate: decode a run plan and resolve every run
//! - run: execute one run of a plan

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fleetrun - run orchestration and C2 command dispatch for experiments
#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode a run plan and check that every run resolves
    Validate {
        /// Run plan file (YAML)
        plan: PathBuf,
    },

    /// Execute one run of a run plan
    Run {
        /// Run plan file (YAML)
        plan: PathBuf,

        /// Experiment the run belongs to
        #[arg(short, long)]
        experiment: String,

        /// Run ID (index into the plan's runs)
        #[arg(short, long, default_value_t = 0)]
        run: usize,

        /// Record component invocations without executing anything
        #[arg(long)]
        dry_run: bool,
    },
}
