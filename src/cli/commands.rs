use std::path::PathBuf;

use clap::{Parser, Subcommand};

use super::{BatchArgs, RunArgs, StatusArgs};

#[derive(Parser, Debug)]
#[command(name = "autoflow", version, about = "Workflow execution orchestrator")]
pub struct Cli {
    /// Configuration file (defaults to ./autoflow.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Shortcut for --log-level debug
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single workflow file to completion
    Run(RunArgs),
    /// Run every workflow in a folder (or an explicit file list) as a batch
    Batch(BatchArgs),
    /// Inspect durable batch and execution records
    Status(StatusArgs),
}
