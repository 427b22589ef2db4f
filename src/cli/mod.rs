//! CLI module for fleetrun - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for validating run plans
//! and executing runs.

pub mod commands;

pub use commands::Cli;
