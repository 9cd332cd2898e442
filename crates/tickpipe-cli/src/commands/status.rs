use serde_json::{json, Value};
use tickpipe_core::PipelineStorage;
use tickpipe_core::UtcDateTime;

use crate::commands::CommandOutput;
use crate::error::CliError;

/// Warehouse overview. The memory backend has nothing persisted to show.
pub async fn run(storage: &PipelineStorage) -> Result<CommandOutput, CliError> {
    let Some(store) = storage.warehouse.clone() else {
        return Ok(CommandOutput::data(json!({ "backend": "memory" })));
    };

    let (db_path, versions, records, counts, open_gaps) = tokio::task::spawn_blocking(move || {
        let warehouse = store.warehouse();
        Ok::<_, tickpipe_warehouse::WarehouseError>((
            warehouse.db_path().display().to_string(),
            warehouse.schema_versions()?,
            warehouse.record_count()?,
            warehouse.job_counts()?,
            warehouse.open_gaps()?,
        ))
    })
    .await??;

    let jobs: serde_json::Map<String, Value> = counts
        .into_iter()
        .map(|count| (count.state.to_ascii_lowercase(), json!(count.jobs)))
        .collect();
    let oldest_gap = open_gaps
        .iter()
        .map(|gap| gap.discovered_at_ns)
        .min()
        .and_then(|nanos| UtcDateTime::from_unix_nanos(nanos).ok());

    Ok(CommandOutput::data(json!({
        "backend": "duckdb",
        "db_path": db_path,
        "schema_versions": versions,
        "records": records,
        "jobs": jobs,
        "open_gaps": open_gaps.len(),
        "oldest_open_gap_discovered_at": oldest_gap,
    })))
}
