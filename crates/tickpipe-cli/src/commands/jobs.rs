use serde_json::json;
use tickpipe_core::{JobState, JobSummary, PipelineStorage};

use crate::cli::JobsArgs;
use crate::commands::CommandOutput;
use crate::error::CliError;

pub async fn run(args: &JobsArgs, storage: &PipelineStorage) -> Result<CommandOutput, CliError> {
    if let Some(id) = args.id {
        let history = storage.jobs.history(id).await?;
        if history.is_empty() {
            return Err(CliError::Usage(format!("no job with id {id}")));
        }
        return Ok(CommandOutput::data(json!({ "job_id": id, "history": history })));
    }

    let summary = summarize(storage).await?;
    if args.summary {
        return Ok(CommandOutput::data(json!({ "jobs": summary })).with_summary(summary));
    }

    let mut jobs = storage.jobs.load_all().await?;
    if let Some(state) = args.state {
        jobs.retain(|job| job.state == state);
    }
    jobs.sort_by(|left, right| left.created_at.cmp(&right.created_at));

    Ok(CommandOutput::data(json!({ "summary": summary, "jobs": jobs })).with_summary(summary))
}

/// State counts from the warehouse view when available, else from the job
/// list itself.
async fn summarize(storage: &PipelineStorage) -> Result<JobSummary, CliError> {
    let Some(store) = storage.warehouse.clone() else {
        let jobs = storage.jobs.load_all().await?;
        return Ok(JobSummary::from_jobs(&jobs));
    };

    let counts = tokio::task::spawn_blocking(move || store.warehouse().job_counts()).await??;
    let mut summary = JobSummary::default();
    for count in counts {
        let state: JobState = count.state.parse().map_err(CliError::Usage)?;
        summary.add(state, usize::try_from(count.jobs).unwrap_or_default());
    }
    Ok(summary)
}
