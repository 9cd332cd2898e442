pub mod duckdb;
pub mod error;
pub mod migrations;
pub mod models;
pub mod views;

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Connection, Row};

pub use duckdb::{AccessMode, DuckDbConnectionManager, PooledConnection};
pub use error::WarehouseError;
pub use models::{
    AuditRow, DeactivationRow, GapRow, JobRow, LedgerRow, OpenGapRow, RecordRow, SeriesRef,
    StateCount, TransitionRow, WritePolicy,
};

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub home: PathBuf,
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl WarehouseConfig {
    /// Places the database under `home/data/tickpipe.duckdb`.
    pub fn in_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let db_path = home.join("data").join("tickpipe.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self::in_home(resolve_tickpipe_home())
    }
}

/// DuckDB-backed store for records, the quality audit trail, job history
/// and the gap ledger.
#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, manager };
        warehouse.initialize()?;
        tracing::info!(path = %warehouse.db_path().display(), "warehouse opened");
        Ok(warehouse)
    }

    /// Applies pending migrations and refreshes the views. Safe to repeat.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        views::create_views(&connection)?;
        Ok(())
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    pub fn schema_versions(&self) -> Result<Vec<String>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        Ok(migrations::applied_versions(&connection)?)
    }

    /// Writes `rows` in one transaction and returns how many rows were
    /// inserted or changed. On error nothing is written.
    pub fn upsert_records(
        &self,
        rows: &[RecordRow],
        policy: WritePolicy,
    ) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            let mut written = 0;
            for row in rows {
                let existing = find_record(&connection, row)?;
                let write = match (&existing, policy) {
                    (None, _) => true,
                    (Some(_), WritePolicy::AlwaysReplace) => true,
                    (Some(_), WritePolicy::KeepExisting) => false,
                    (Some(stored), WritePolicy::ReplaceIfChanged) => !stored.same_payload(row),
                };
                if !write {
                    continue;
                }
                if existing.is_some() {
                    update_record(&connection, row)?;
                } else {
                    insert_record(&connection, row)?;
                }
                written += 1;
            }
            Ok(written)
        })();

        finalize_transaction(&connection, result)
    }

    /// Rows of every source for `series` with `start_ns <= ts < end_ns`,
    /// ordered by timestamp then source.
    pub fn query_records(
        &self,
        series: &SeriesRef,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<RecordRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT symbol, asset_class, exchange, granularity, ts_ns, source, kind,
       open, high, low, close, volume, price, size, ingested_at_ns, is_adjusted
FROM records
WHERE symbol = ? AND asset_class = ? AND exchange = ? AND granularity = ?
  AND ts_ns >= ? AND ts_ns < ?
ORDER BY ts_ns, source
"#,
        )?;
        let rows = statement.query_map(
            params![
                series.symbol,
                series.asset_class,
                series.exchange,
                series.granularity,
                start_ns,
                end_ns
            ],
            record_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn record_count(&self) -> Result<i64, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        Ok(connection.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    pub fn record_audit(&self, row: &AuditRow) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute(
            r#"
INSERT OR REPLACE INTO quality_audit (
    batch_id, symbol, asset_class, exchange, granularity, source, data_kind,
    window_start_ns, window_end_ns, outcome, request_json, verdict_json, recorded_at_ns
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
            params![
                row.batch_id,
                row.series.symbol,
                row.series.asset_class,
                row.series.exchange,
                row.series.granularity,
                row.source,
                row.data_kind,
                row.window_start_ns,
                row.window_end_ns,
                row.outcome,
                row.request_json,
                row.verdict_json,
                row.recorded_at_ns
            ],
        )?;
        Ok(())
    }

    /// Audit entries of one instrument across granularities, oldest first.
    pub fn audit_trail(
        &self,
        symbol: &str,
        asset_class: &str,
        exchange: &str,
    ) -> Result<Vec<AuditRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT batch_id, symbol, asset_class, exchange, granularity, source, data_kind,
       window_start_ns, window_end_ns, outcome, request_json, verdict_json, recorded_at_ns
FROM quality_audit
WHERE symbol = ? AND asset_class = ? AND exchange = ?
ORDER BY recorded_at_ns, batch_id
"#,
        )?;
        let rows = statement.query_map(params![symbol, asset_class, exchange], |row| {
            Ok(AuditRow {
                batch_id: row.get(0)?,
                series: SeriesRef {
                    symbol: row.get(1)?,
                    asset_class: row.get(2)?,
                    exchange: row.get(3)?,
                    granularity: row.get(4)?,
                },
                source: row.get(5)?,
                data_kind: row.get(6)?,
                window_start_ns: row.get(7)?,
                window_end_ns: row.get(8)?,
                outcome: row.get(9)?,
                request_json: row.get(10)?,
                verdict_json: row.get(11)?,
                recorded_at_ns: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Stores the job's latest state and appends `transition` atomically.
    pub fn save_job(&self, job: &JobRow, transition: &TransitionRow) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            let updated = connection.execute(
                r#"
UPDATE fetch_jobs
SET priority_class = ?, state = ?, attempt_count = ?, last_error = ?,
    next_attempt_at_ns = ?, updated_at_ns = ?, job_json = ?
WHERE job_id = ?
"#,
                params![
                    job.priority_class,
                    job.state,
                    job.attempt_count,
                    job.last_error,
                    job.next_attempt_at_ns,
                    job.updated_at_ns,
                    job.job_json,
                    job.job_id
                ],
            )?;
            if updated == 0 {
                connection.execute(
                    r#"
INSERT INTO fetch_jobs (
    job_id, symbol, asset_class, exchange, source, granularity, data_kind, priority_class,
    state, attempt_count, last_error, next_attempt_at_ns, updated_at_ns, job_json
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
                    params![
                        job.job_id,
                        job.series.symbol,
                        job.series.asset_class,
                        job.series.exchange,
                        job.source,
                        job.series.granularity,
                        job.data_kind,
                        job.priority_class,
                        job.state,
                        job.attempt_count,
                        job.last_error,
                        job.next_attempt_at_ns,
                        job.updated_at_ns,
                        job.job_json
                    ],
                )?;
            }
            connection.execute(
                r#"
INSERT INTO job_history (job_id, from_state, to_state, attempt, error, at_ns)
VALUES (?, ?, ?, ?, ?, ?)
"#,
                params![
                    transition.job_id,
                    transition.from_state,
                    transition.to_state,
                    transition.attempt,
                    transition.error,
                    transition.at_ns
                ],
            )?;
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    pub fn load_jobs(&self) -> Result<Vec<JobRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT job_id, symbol, asset_class, exchange, source, granularity, data_kind, priority_class,
       state, attempt_count, last_error, next_attempt_at_ns, updated_at_ns, job_json
FROM fetch_jobs
ORDER BY updated_at_ns, job_id
"#,
        )?;
        let rows = statement.query_map([], |row| {
            Ok(JobRow {
                job_id: row.get(0)?,
                series: SeriesRef {
                    symbol: row.get(1)?,
                    asset_class: row.get(2)?,
                    exchange: row.get(3)?,
                    granularity: row.get(5)?,
                },
                source: row.get(4)?,
                data_kind: row.get(6)?,
                priority_class: row.get(7)?,
                state: row.get(8)?,
                attempt_count: row.get(9)?,
                last_error: row.get(10)?,
                next_attempt_at_ns: row.get(11)?,
                updated_at_ns: row.get(12)?,
                job_json: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Transitions of one job in the order they were recorded.
    pub fn job_history(&self, job_id: &str) -> Result<Vec<TransitionRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT job_id, from_state, to_state, attempt, error, at_ns
FROM job_history
WHERE job_id = ?
ORDER BY seq
"#,
        )?;
        let rows = statement.query_map([job_id], |row| {
            Ok(TransitionRow {
                job_id: row.get(0)?,
                from_state: row.get(1)?,
                to_state: row.get(2)?,
                attempt: row.get(3)?,
                error: row.get(4)?,
                at_ns: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn job_counts(&self) -> Result<Vec<StateCount>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement =
            connection.prepare("SELECT state, jobs FROM vw_job_states ORDER BY state")?;
        let rows = statement.query_map([], |row| {
            Ok(StateCount {
                state: row.get(0)?,
                jobs: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replaces the stored ledger state of one series.
    pub fn save_ledger(&self, ledger: &LedgerRow) -> Result<(), WarehouseError> {
        let key = ledger.series.key();
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            let updated = connection.execute(
                r#"
UPDATE ledger_series
SET watermark_ns = ?, snapshot_json = ?, updated_at_ns = ?
WHERE series_key = ?
"#,
                params![
                    ledger.watermark_ns,
                    ledger.snapshot_json,
                    ledger.updated_at_ns,
                    key
                ],
            )?;
            if updated == 0 {
                connection.execute(
                    r#"
INSERT INTO ledger_series (
    series_key, symbol, asset_class, exchange, granularity, watermark_ns, snapshot_json, updated_at_ns
) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#,
                    params![
                        key,
                        ledger.series.symbol,
                        ledger.series.asset_class,
                        ledger.series.exchange,
                        ledger.series.granularity,
                        ledger.watermark_ns,
                        ledger.snapshot_json,
                        ledger.updated_at_ns
                    ],
                )?;
            }
            connection.execute("DELETE FROM gap_intervals WHERE series_key = ?", [&key])?;
            for gap in &ledger.gaps {
                connection.execute(
                    r#"
INSERT INTO gap_intervals (
    series_key, symbol, asset_class, exchange, granularity,
    start_ns, end_ns, discovered_at_ns, resolved_at_ns
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
                    params![
                        key,
                        ledger.series.symbol,
                        ledger.series.asset_class,
                        ledger.series.exchange,
                        ledger.series.granularity,
                        gap.start_ns,
                        gap.end_ns,
                        gap.discovered_at_ns,
                        gap.resolved_at_ns
                    ],
                )?;
            }
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    pub fn load_ledger(&self) -> Result<Vec<LedgerRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;

        let mut gaps: BTreeMap<String, Vec<GapRow>> = BTreeMap::new();
        let mut statement = connection.prepare(
            r#"
SELECT series_key, start_ns, end_ns, discovered_at_ns, resolved_at_ns
FROM gap_intervals
ORDER BY series_key, start_ns
"#,
        )?;
        let gap_rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                GapRow {
                    start_ns: row.get(1)?,
                    end_ns: row.get(2)?,
                    discovered_at_ns: row.get(3)?,
                    resolved_at_ns: row.get(4)?,
                },
            ))
        })?;
        for entry in gap_rows {
            let (key, gap) = entry?;
            gaps.entry(key).or_default().push(gap);
        }

        let mut statement = connection.prepare(
            r#"
SELECT series_key, symbol, asset_class, exchange, granularity, watermark_ns, snapshot_json, updated_at_ns
FROM ledger_series
ORDER BY series_key
"#,
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                LedgerRow {
                    series: SeriesRef {
                        symbol: row.get(1)?,
                        asset_class: row.get(2)?,
                        exchange: row.get(3)?,
                        granularity: row.get(4)?,
                    },
                    watermark_ns: row.get(5)?,
                    snapshot_json: row.get(6)?,
                    updated_at_ns: row.get(7)?,
                    gaps: Vec::new(),
                },
            ))
        })?;

        let mut ledgers = Vec::new();
        for entry in rows {
            let (key, mut ledger) = entry?;
            ledger.gaps = gaps.remove(&key).unwrap_or_default();
            ledgers.push(ledger);
        }
        Ok(ledgers)
    }

    pub fn open_gaps(&self) -> Result<Vec<OpenGapRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT symbol, asset_class, exchange, granularity, start_ns, end_ns, discovered_at_ns
FROM vw_open_gaps
ORDER BY series_key, start_ns
"#,
        )?;
        let rows = statement.query_map([], |row| {
            Ok(OpenGapRow {
                series: SeriesRef {
                    symbol: row.get(0)?,
                    asset_class: row.get(1)?,
                    exchange: row.get(2)?,
                    granularity: row.get(3)?,
                },
                start_ns: row.get(4)?,
                end_ns: row.get(5)?,
                discovered_at_ns: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Records a disabled (instrument, source) pair. The first reason wins.
    pub fn deactivate(&self, row: &DeactivationRow) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        connection.execute(
            r#"
INSERT OR IGNORE INTO source_deactivations (symbol, asset_class, exchange, source, reason, at_ns)
VALUES (?, ?, ?, ?, ?, ?)
"#,
            params![
                row.symbol,
                row.asset_class,
                row.exchange,
                row.source,
                row.reason,
                row.at_ns
            ],
        )?;
        Ok(())
    }

    pub fn deactivations(&self) -> Result<Vec<DeactivationRow>, WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            r#"
SELECT symbol, asset_class, exchange, source, reason, at_ns
FROM source_deactivations
ORDER BY at_ns, symbol, source
"#,
        )?;
        let rows = statement.query_map([], |row| {
            Ok(DeactivationRow {
                symbol: row.get(0)?,
                asset_class: row.get(1)?,
                exchange: row.get(2)?,
                source: row.get(3)?,
                reason: row.get(4)?,
                at_ns: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn find_record(connection: &Connection, row: &RecordRow) -> Result<Option<RecordRow>, WarehouseError> {
    let mut statement = connection.prepare(
        r#"
SELECT symbol, asset_class, exchange, granularity, ts_ns, source, kind,
       open, high, low, close, volume, price, size, ingested_at_ns, is_adjusted
FROM records
WHERE symbol = ? AND asset_class = ? AND exchange = ? AND granularity = ?
  AND ts_ns = ? AND source = ?
"#,
    )?;
    let mut rows = statement.query_map(
        params![
            row.series.symbol,
            row.series.asset_class,
            row.series.exchange,
            row.series.granularity,
            row.ts_ns,
            row.source
        ],
        record_from_row,
    )?;
    match rows.next() {
        Some(found) => Ok(Some(found?)),
        None => Ok(None),
    }
}

fn insert_record(connection: &Connection, row: &RecordRow) -> Result<(), WarehouseError> {
    connection.execute(
        r#"
INSERT INTO records (
    symbol, asset_class, exchange, granularity, ts_ns, source, kind,
    open, high, low, close, volume, price, size, ingested_at_ns, is_adjusted
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#,
        params![
            row.series.symbol,
            row.series.asset_class,
            row.series.exchange,
            row.series.granularity,
            row.ts_ns,
            row.source,
            row.kind,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
            row.price,
            row.size,
            row.ingested_at_ns,
            row.is_adjusted
        ],
    )?;
    Ok(())
}

fn update_record(connection: &Connection, row: &RecordRow) -> Result<(), WarehouseError> {
    connection.execute(
        r#"
UPDATE records
SET kind = ?, open = ?, high = ?, low = ?, close = ?, volume = ?, price = ?, size = ?,
    ingested_at_ns = ?, is_adjusted = ?
WHERE symbol = ? AND asset_class = ? AND exchange = ? AND granularity = ?
  AND ts_ns = ? AND source = ?
"#,
        params![
            row.kind,
            row.open,
            row.high,
            row.low,
            row.close,
            row.volume,
            row.price,
            row.size,
            row.ingested_at_ns,
            row.is_adjusted,
            row.series.symbol,
            row.series.asset_class,
            row.series.exchange,
            row.series.granularity,
            row.ts_ns,
            row.source
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> Result<RecordRow, ::duckdb::Error> {
    Ok(RecordRow {
        series: SeriesRef {
            symbol: row.get(0)?,
            asset_class: row.get(1)?,
            exchange: row.get(2)?,
            granularity: row.get(3)?,
        },
        ts_ns: row.get(4)?,
        source: row.get(5)?,
        kind: row.get(6)?,
        open: row.get(7)?,
        high: row.get(8)?,
        low: row.get(9)?,
        close: row.get(10)?,
        volume: row.get(11)?,
        price: row.get(12)?,
        size: row.get(13)?,
        ingested_at_ns: row.get(14)?,
        is_adjusted: row.get(15)?,
    })
}

fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_tickpipe_home() -> PathBuf {
    if let Some(path) = env::var_os("TICKPIPE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".tickpipe");
    }

    PathBuf::from(".tickpipe")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open(dir: &Path) -> Warehouse {
        Warehouse::open(WarehouseConfig::in_home(dir.join("home"))).expect("warehouse open")
    }

    fn series() -> SeriesRef {
        SeriesRef {
            symbol: String::from("AAPL"),
            asset_class: String::from("equity"),
            exchange: String::from("XNAS"),
            granularity: String::from("1d"),
        }
    }

    fn bar(ts_ns: i64, close: f64) -> RecordRow {
        RecordRow {
            series: series(),
            ts_ns,
            source: String::from("simulated"),
            kind: String::from("bar"),
            open: Some(close),
            high: Some(close),
            low: Some(close),
            close: Some(close),
            volume: Some(10.0),
            price: None,
            size: None,
            ingested_at_ns: 1,
            is_adjusted: false,
        }
    }

    #[test]
    fn initializes_schema_once() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        warehouse.initialize().expect("second initialize");

        let versions = warehouse.schema_versions().expect("versions");
        assert_eq!(versions, vec!["0001_records", "0002_jobs", "0003_gap_ledger"]);
    }

    #[test]
    fn replace_if_changed_skips_identical_rows() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        let rows = vec![bar(100, 10.0), bar(200, 11.0)];

        let first = warehouse
            .upsert_records(&rows, WritePolicy::ReplaceIfChanged)
            .expect("first upsert");
        let second = warehouse
            .upsert_records(&rows, WritePolicy::ReplaceIfChanged)
            .expect("second upsert");
        let changed = warehouse
            .upsert_records(&[bar(200, 12.0)], WritePolicy::ReplaceIfChanged)
            .expect("changed upsert");

        assert_eq!((first, second, changed), (2, 0, 1));
        assert_eq!(warehouse.record_count().expect("count"), 2);

        let stored = warehouse.query_records(&series(), 0, 1_000).expect("query");
        assert_eq!(stored[1].close, Some(12.0));
    }

    #[test]
    fn keep_existing_never_overwrites() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        warehouse
            .upsert_records(&[bar(100, 10.0)], WritePolicy::AlwaysReplace)
            .expect("seed");
        let written = warehouse
            .upsert_records(&[bar(100, 99.0)], WritePolicy::KeepExisting)
            .expect("keep");

        assert_eq!(written, 0);
        let stored = warehouse.query_records(&series(), 0, 1_000).expect("query");
        assert_eq!(stored[0].close, Some(10.0));
    }

    #[test]
    fn query_window_is_half_open() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        warehouse
            .upsert_records(
                &[bar(100, 1.0), bar(200, 2.0), bar(300, 3.0)],
                WritePolicy::AlwaysReplace,
            )
            .expect("seed");

        let stored = warehouse.query_records(&series(), 100, 300).expect("query");
        let stamps: Vec<i64> = stored.iter().map(|row| row.ts_ns).collect();
        assert_eq!(stamps, vec![100, 200]);
    }

    #[test]
    fn job_saves_keep_latest_row_and_full_history() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        let mut job = JobRow {
            job_id: String::from("job-1"),
            series: series(),
            source: String::from("simulated"),
            data_kind: String::from("historical"),
            priority_class: String::from("backfill"),
            state: String::from("PENDING"),
            attempt_count: 0,
            last_error: None,
            next_attempt_at_ns: None,
            updated_at_ns: 1,
            job_json: String::from("{}"),
        };
        let transition = |from: Option<&str>, to: &str, at_ns: i64| TransitionRow {
            job_id: String::from("job-1"),
            from_state: from.map(String::from),
            to_state: String::from(to),
            attempt: 0,
            error: None,
            at_ns,
        };

        warehouse
            .save_job(&job, &transition(None, "PENDING", 1))
            .expect("pending");
        job.state = String::from("RUNNING");
        job.updated_at_ns = 2;
        warehouse
            .save_job(&job, &transition(Some("PENDING"), "RUNNING", 2))
            .expect("running");

        let jobs = warehouse.load_jobs().expect("jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, "RUNNING");

        let history = warehouse.job_history("job-1").expect("history");
        let states: Vec<&str> = history.iter().map(|row| row.to_state.as_str()).collect();
        assert_eq!(states, vec!["PENDING", "RUNNING"]);

        let counts = warehouse.job_counts().expect("counts");
        assert_eq!(
            counts,
            vec![StateCount {
                state: String::from("RUNNING"),
                jobs: 1
            }]
        );
    }

    #[test]
    fn ledger_round_trips_with_open_gap_view() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        let ledger = LedgerRow {
            series: series(),
            watermark_ns: Some(500),
            snapshot_json: String::from("{\"coverage\":[]}"),
            updated_at_ns: 9,
            gaps: vec![
                GapRow {
                    start_ns: 100,
                    end_ns: 200,
                    discovered_at_ns: 5,
                    resolved_at_ns: Some(8),
                },
                GapRow {
                    start_ns: 300,
                    end_ns: 400,
                    discovered_at_ns: 6,
                    resolved_at_ns: None,
                },
            ],
        };
        warehouse.save_ledger(&ledger).expect("save");
        warehouse.save_ledger(&ledger).expect("save again");

        assert_eq!(warehouse.load_ledger().expect("load"), vec![ledger]);
        let open_gaps = warehouse.open_gaps().expect("open gaps");
        assert_eq!(open_gaps.len(), 1);
        assert_eq!((open_gaps[0].start_ns, open_gaps[0].end_ns), (300, 400));
    }

    #[test]
    fn deactivation_keeps_first_reason() {
        let temp = tempdir().expect("tempdir");
        let warehouse = open(temp.path());
        let row = |reason: &str| DeactivationRow {
            symbol: String::from("ZZZZ"),
            asset_class: String::from("equity"),
            exchange: String::from("XNAS"),
            source: String::from("simulated"),
            reason: String::from(reason),
            at_ns: 1,
        };

        warehouse.deactivate(&row("unknown symbol")).expect("first");
        warehouse.deactivate(&row("again")).expect("second");

        let stored = warehouse.deactivations().expect("list");
        assert_eq!(stored, vec![row("unknown symbol")]);
    }
}
