use serde_json::json;
use tickpipe_core::config::PipelineConfig;
use tickpipe_core::PipelineReport;
use tokio::sync::watch;

use crate::cli::RunArgs;
use crate::commands::{start_pipeline, CommandOutput};
use crate::error::CliError;

pub async fn run(args: &RunArgs, config: PipelineConfig) -> Result<CommandOutput, CliError> {
    let pipeline = start_pipeline(config).await?;

    let backfills = if args.backfill {
        pipeline.backfill_configured().await?.len()
    } else {
        0
    };

    let report = if args.until_idle {
        let refreshed = pipeline.scheduler().enqueue_refresh().await;
        tracing::info!(backfills, refreshed, "draining queued work");
        PipelineReport {
            jobs: pipeline.run_until_idle().await,
            live: None,
        }
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let signal = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("shutdown requested"),
                Err(error) => tracing::error!(%error, "failed to listen for ctrl-c"),
            }
            let _ = shutdown_tx.send(true);
        });
        tracing::info!(backfills, "pipeline running, press ctrl-c to stop");
        let report = pipeline.run(shutdown_rx).await;
        signal.abort();
        report
    };

    let summary = pipeline.scheduler().summary();
    Ok(CommandOutput::data(json!({
        "report": report,
        "jobs": summary,
        "open_gaps": pipeline.ledger().all_open_gaps().len(),
    }))
    .with_summary(summary))
}
