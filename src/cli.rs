use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// review-gc: prune stale review tracking refs from a local repository.
#[derive(Debug, Parser)]
#[command(name = "review-gc", version, about, long_about = None, disable_help_flag = true)]
pub struct Cli {
    /// Print help
    #[arg(short = 'h', long, short_alias = '?', action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Repository to collect (defaults to the current directory)
    #[arg(short = 'C', value_name = "DIR", default_value = ".")]
    pub repo: PathBuf,

    /// Path to config file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Show what would be deleted without deleting anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Increase log verbosity (-v = DEBUG, -vv = TRACE)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Log everything, including every subprocess and decision (TRACE)
    #[arg(long, conflicts_with = "quiet")]
    pub debug: bool,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Only run if the configured interval has passed since the last GC
    #[arg(long)]
    pub auto: bool,
}
