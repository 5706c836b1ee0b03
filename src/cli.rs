//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};

/// Run demonstration jobs on a fork-based worker pool.
#[derive(Parser, Debug)]
#[command(name = "forkpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable colored output.
    #[arg(
        long,
        env = "NO_COLOR",
        global = true,
        value_parser = clap::builder::FalseyValueParser::new()
    )]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a batch of built-in jobs and report each outcome.
    Run(RunArgs),

    /// List the built-in jobs.
    Jobs,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of persistent workers [default: FORKPOOL_WORKERS or available parallelism].
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Number of jobs to submit; job `i` gets input `i`.
    #[arg(short = 'n', long, default_value_t = 8)]
    pub count: u64,

    /// Which built-in job to run.
    #[arg(short, long, value_enum, default_value_t = DemoJob::Square)]
    pub job: DemoJob,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

/// Built-in jobs, one per fault category.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DemoJob {
    /// Square the input.
    #[default]
    Square,
    /// Divide by zero (job failure).
    Fail,
    /// Abort the process (abnormal termination).
    Crash,
    /// Report a full shared heap (resource exhaustion).
    Exhaust,
}

/// Output format for job results.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored table.
    #[default]
    Table,
    /// Tab-separated lines.
    Plain,
    /// JSON document.
    Json,
}
