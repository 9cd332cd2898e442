use serde_json::json;
use tickpipe_core::config::PipelineConfig;
use tickpipe_core::scheduler::PriorityClass;
use tickpipe_core::{InstrumentId, JobSummary, TimeWindow, UtcDateTime};

use crate::cli::BackfillArgs;
use crate::commands::{start_pipeline, CommandOutput};
use crate::error::CliError;

pub async fn run(args: &BackfillArgs, config: PipelineConfig) -> Result<CommandOutput, CliError> {
    let target = match &args.symbol {
        Some(symbol) => Some((resolve_instrument(args, symbol, &config)?, window(args)?)),
        None => None,
    };
    let pipeline = start_pipeline(config).await?;

    let job_ids = match target {
        Some((instrument, window)) => {
            let id = match &args.source {
                Some(source) => {
                    pipeline
                        .scheduler()
                        .enqueue_from(
                            source.clone(),
                            instrument,
                            window,
                            args.granularity,
                            PriorityClass::Backfill,
                        )
                        .await
                        .map_err(tickpipe_core::CoreError::from)?
                }
                None => pipeline.backfill(instrument, window, args.granularity).await?,
            };
            vec![id]
        }
        None => pipeline.backfill_configured().await?,
    };

    let report = pipeline.run_until_idle().await;
    let jobs: Vec<_> = job_ids
        .iter()
        .filter_map(|id| pipeline.scheduler().job(*id))
        .collect();
    let summary = JobSummary::from_jobs(&jobs);

    Ok(CommandOutput::data(json!({
        "report": report,
        "jobs": jobs,
        "open_gaps": pipeline.ledger().all_open_gaps(),
    }))
    .with_summary(summary))
}

/// Uses the flags when given, else the configured instrument with this symbol.
fn resolve_instrument(
    args: &BackfillArgs,
    symbol: &str,
    config: &PipelineConfig,
) -> Result<InstrumentId, CliError> {
    if let (Some(asset_class), Some(exchange)) = (args.asset_class, args.exchange.as_deref()) {
        return Ok(InstrumentId::new(symbol, asset_class, exchange)?);
    }
    let configured = config
        .instruments
        .iter()
        .find(|instrument| instrument.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| {
            CliError::Usage(format!(
                "'{symbol}' is not configured, pass --asset-class and --exchange"
            ))
        })?;
    Ok(configured.instrument_id()?)
}

fn window(args: &BackfillArgs) -> Result<TimeWindow, CliError> {
    let end = match &args.end {
        Some(end) => UtcDateTime::parse(end)?,
        None => match args.granularity.step() {
            Some(step) => UtcDateTime::now().floor_to(step),
            None => UtcDateTime::now(),
        },
    };
    let start = match &args.start {
        Some(start) => UtcDateTime::parse(start)?,
        None => end.saturating_sub(time::Duration::days(i64::from(args.days))),
    };
    Ok(TimeWindow::new(start, end)?)
}
