//! Review views over the pipeline tables.

use ::duckdb::Connection;

/// Creates or refreshes:
/// - `vw_open_gaps`: unresolved gaps with their length in nanoseconds
/// - `vw_job_states`: job count per state
/// - `vw_failed_jobs`: terminal failures with their last error
/// - `vw_rejected_batches`: audit entries whose verdict rejected the batch
pub fn create_views(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE OR REPLACE VIEW vw_open_gaps AS
SELECT
    series_key,
    symbol,
    asset_class,
    exchange,
    granularity,
    start_ns,
    end_ns,
    end_ns - start_ns AS length_ns,
    discovered_at_ns
FROM gap_intervals
WHERE resolved_at_ns IS NULL;

CREATE OR REPLACE VIEW vw_job_states AS
SELECT state, COUNT(*) AS jobs
FROM fetch_jobs
GROUP BY state;

CREATE OR REPLACE VIEW vw_failed_jobs AS
SELECT job_id, symbol, asset_class, exchange, source, granularity, attempt_count, last_error, updated_at_ns
FROM fetch_jobs
WHERE state = 'FAILED';

CREATE OR REPLACE VIEW vw_rejected_batches AS
SELECT batch_id, symbol, asset_class, exchange, granularity, source, window_start_ns, window_end_ns, recorded_at_ns
FROM quality_audit
WHERE outcome = 'REJECT';
",
    )
}
