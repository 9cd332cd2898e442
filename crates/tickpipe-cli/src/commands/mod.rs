mod backfill;
mod gaps;
mod init;
mod jobs;
mod run;
mod status;

use std::path::Path;

use serde_json::Value;
use tickpipe_core::config::PipelineConfig;
use tickpipe_core::{JobSummary, Pipeline, PipelineStorage};

use crate::cli::{Cli, Command};
use crate::error::CliError;

/// JSON payload of a command plus the job counts that decide its exit code.
pub struct CommandOutput {
    pub data: Value,
    pub summary: Option<JobSummary>,
}

impl CommandOutput {
    pub fn data(data: Value) -> Self {
        Self {
            data,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: JobSummary) -> Self {
        self.summary = Some(summary);
        self
    }
}

pub async fn run(cli: &Cli) -> Result<CommandOutput, CliError> {
    match &cli.command {
        Command::Init(args) => init::run(args, &cli.config).await,
        Command::Run(args) => run::run(args, load_config(&cli.config)?).await,
        Command::Backfill(args) => backfill::run(args, load_config(&cli.config)?).await,
        Command::Jobs(args) => jobs::run(args, &open_storage(&cli.config).await?).await,
        Command::Gaps(args) => gaps::run(args, &open_storage(&cli.config).await?).await,
        Command::Status => status::run(&open_storage(&cli.config).await?).await,
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig, CliError> {
    Ok(PipelineConfig::load(path)?)
}

/// Builds the pipeline and resumes persisted jobs and ledger state.
async fn start_pipeline(config: PipelineConfig) -> Result<Pipeline, CliError> {
    let pipeline = Pipeline::from_config(config).await?;
    let resumed = pipeline.start().await?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed persisted jobs");
    }
    Ok(pipeline)
}

/// Opens storage only. Inspection commands need no adapters or credentials.
async fn open_storage(path: &Path) -> Result<PipelineStorage, CliError> {
    let config = load_config(path)?;
    Ok(PipelineStorage::open(&config).await?)
}
