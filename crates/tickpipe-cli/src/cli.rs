//! CLI argument definitions for tickpipe.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `init` | Write a sample config and create the warehouse |
//! | `run` | Run the scheduler and realtime feed |
//! | `backfill` | Queue and run a historical backfill |
//! | `jobs` | List jobs, their history and state counts |
//! | `gaps` | List open gaps from the ledger |
//! | `status` | Summarize the warehouse contents |
//!
//! # Global Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `--config` | `tickpipe.toml` | Pipeline config file |
//! | `--log-format` | `pretty` | Log format on stderr (pretty, json) |
//! | `--pretty` | `false` | Pretty-print JSON output |
//!
//! # Examples
//!
//! ```bash
//! tickpipe init
//! tickpipe backfill AAPL --asset-class equity --exchange XNAS --days 30
//! tickpipe run --until-idle
//! tickpipe jobs --state failed --pretty
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tickpipe_core::{AssetClass, Granularity, JobId, JobState, SourceId};

/// tickpipe - market data ingestion pipeline
///
/// Fetches historical and live market data from configured sources,
/// validates every batch and keeps a gap ledger of what is missing.
#[derive(Debug, Parser)]
#[command(
    name = "tickpipe",
    author,
    version,
    about = "Market data ingestion, quality and scheduling pipeline"
)]
pub struct Cli {
    /// Pipeline config file.
    #[arg(long, global = true, default_value = "tickpipe.toml")]
    pub config: PathBuf,

    /// Log format written to stderr. Levels follow `RUST_LOG`.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Pretty-print JSON output.
    #[arg(long, global = true, default_value_t = false)]
    pub pretty: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a sample config and apply warehouse migrations.
    Init(InitArgs),

    /// Run the scheduler and, when enabled, the realtime feed.
    ///
    /// Without `--until-idle` the pipeline runs until Ctrl-C, refreshing
    /// configured instruments on the refresh interval.
    Run(RunArgs),

    /// Queue a backfill and run the scheduler until it settles.
    Backfill(BackfillArgs),

    /// Inspect persisted fetch jobs.
    Jobs(JobsArgs),

    /// List open gaps recorded in the ledger.
    Gaps(GapsArgs),

    /// Summarize warehouse schema, record and job counts.
    Status,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    /// Overwrite an existing config file.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Drain pending work and exit instead of running until Ctrl-C.
    #[arg(long, default_value_t = false)]
    pub until_idle: bool,

    /// Queue a backfill of every configured instrument before running.
    #[arg(long, default_value_t = false)]
    pub backfill: bool,
}

#[derive(Debug, Args)]
pub struct BackfillArgs {
    /// Symbol to backfill. Omit to backfill every configured instrument.
    pub symbol: Option<String>,

    #[arg(long, requires = "symbol")]
    pub asset_class: Option<AssetClass>,

    #[arg(long, requires = "symbol")]
    pub exchange: Option<String>,

    #[arg(long, default_value = "1d")]
    pub granularity: Granularity,

    /// Window start (RFC 3339). Defaults to `--days` before the end.
    #[arg(long)]
    pub start: Option<String>,

    /// Window end (RFC 3339). Defaults to now, floored to the granularity.
    #[arg(long)]
    pub end: Option<String>,

    #[arg(long, default_value_t = 30)]
    pub days: u32,

    /// Fetch from this source instead of the first routed one.
    #[arg(long, requires = "symbol")]
    pub source: Option<SourceId>,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    /// Only list jobs in this state (e.g. `failed`, `retry_scheduled`).
    #[arg(long)]
    pub state: Option<JobState>,

    /// Show the transition history of one job.
    #[arg(long, conflicts_with = "state")]
    pub id: Option<JobId>,

    /// Print state counts only.
    #[arg(long, default_value_t = false)]
    pub summary: bool,
}

#[derive(Debug, Args)]
pub struct GapsArgs {
    /// Only list gaps for this symbol.
    #[arg(long)]
    pub symbol: Option<String>,
}
