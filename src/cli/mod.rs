//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{CancelCommand, HistoryCommand, RunCommand, StatusCommand, TasksCommand, ValidateCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Declarative pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "taskline")]
#[command(version)]
#[command(about = "Run clone/lint/test/build/deploy pipelines as a dependency graph", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the run history database
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate a pipeline without running it
    Validate(ValidateCommand),

    /// Show the state of a recorded run
    Status(StatusCommand),

    /// Ask a running pipeline to cancel
    Cancel(CancelCommand),

    /// Show run history
    History(HistoryCommand),

    /// List available task kinds
    Tasks(TasksCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
