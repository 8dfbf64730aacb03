//! CLI command definitions

use crate::execution::SchedulingStrategy;
use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Parameter overrides (name=value; array values are comma-separated)
    #[arg(short, long, value_parser = parse_key_value)]
    pub param: Vec<(String, String)>,

    /// Additional task kinds (YAML catalog)
    #[arg(long)]
    pub catalog: Vec<PathBuf>,

    /// Scheduling strategy: sequential, parallel or limited:N
    #[arg(long, default_value = "parallel")]
    pub strategy: SchedulingStrategy,

    /// Ask running tasks to stop as soon as one fails
    #[arg(long)]
    pub fail_fast: bool,

    /// Default per-task timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Bind a workspace to an existing directory (name=path)
    #[arg(short, long, value_parser = parse_workspace)]
    pub workspace: Vec<(String, PathBuf)>,

    /// Directory under which run workspaces are created
    #[arg(long)]
    pub workspace_root: Option<PathBuf>,

    /// Keep the run's workspace directory after it finishes
    #[arg(long)]
    pub retain_workspace: bool,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Print the final snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Parameter values to validate with (name=value)
    #[arg(short, long, value_parser = parse_key_value)]
    pub param: Vec<(String, String)>,

    /// Additional task kinds (YAML catalog)
    #[arg(long)]
    pub catalog: Vec<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the state of a recorded run
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Run ID (a unique prefix is enough)
    pub run_id: String,

    /// Also print the event log
    #[arg(long)]
    pub events: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Ask a running pipeline to cancel
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Run ID (a unique prefix is enough)
    pub run_id: String,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List available task kinds
#[derive(Debug, Args, Clone)]
pub struct TasksCommand {
    /// Additional task kinds (YAML catalog)
    #[arg(long)]
    pub catalog: Vec<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

fn parse_workspace(s: &str) -> Result<(String, PathBuf), String> {
    parse_key_value(s).map(|(name, path)| (name, PathBuf::from(path)))
}
