use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_records",
        sql: r#"
CREATE TABLE IF NOT EXISTS records (
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    granularity TEXT NOT NULL,
    ts_ns BIGINT NOT NULL,
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    open DOUBLE,
    high DOUBLE,
    low DOUBLE,
    close DOUBLE,
    volume DOUBLE,
    price DOUBLE,
    size DOUBLE,
    ingested_at_ns BIGINT NOT NULL,
    is_adjusted BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY(symbol, asset_class, exchange, granularity, ts_ns, source)
);

CREATE TABLE IF NOT EXISTS quality_audit (
    batch_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    granularity TEXT NOT NULL,
    source TEXT NOT NULL,
    data_kind TEXT NOT NULL,
    window_start_ns BIGINT NOT NULL,
    window_end_ns BIGINT NOT NULL,
    outcome TEXT NOT NULL,
    request_json TEXT NOT NULL,
    verdict_json TEXT NOT NULL,
    recorded_at_ns BIGINT NOT NULL
);
"#,
    },
    Migration {
        version: "0002_jobs",
        sql: r#"
CREATE TABLE IF NOT EXISTS fetch_jobs (
    job_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    source TEXT NOT NULL,
    granularity TEXT NOT NULL,
    data_kind TEXT NOT NULL,
    priority_class TEXT NOT NULL,
    state TEXT NOT NULL,
    attempt_count BIGINT NOT NULL,
    last_error TEXT,
    next_attempt_at_ns BIGINT,
    updated_at_ns BIGINT NOT NULL,
    job_json TEXT NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS job_history_seq;

CREATE TABLE IF NOT EXISTS job_history (
    seq BIGINT NOT NULL DEFAULT nextval('job_history_seq'),
    job_id TEXT NOT NULL,
    from_state TEXT,
    to_state TEXT NOT NULL,
    attempt BIGINT NOT NULL,
    error TEXT,
    at_ns BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_deactivations (
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    at_ns BIGINT NOT NULL,
    PRIMARY KEY(symbol, asset_class, exchange, source)
);
"#,
    },
    Migration {
        version: "0003_gap_ledger",
        sql: r#"
CREATE TABLE IF NOT EXISTS ledger_series (
    series_key TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    granularity TEXT NOT NULL,
    watermark_ns BIGINT,
    snapshot_json TEXT NOT NULL,
    updated_at_ns BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS gap_intervals (
    series_key TEXT NOT NULL,
    symbol TEXT NOT NULL,
    asset_class TEXT NOT NULL,
    exchange TEXT NOT NULL,
    granularity TEXT NOT NULL,
    start_ns BIGINT NOT NULL,
    end_ns BIGINT NOT NULL,
    discovered_at_ns BIGINT NOT NULL,
    resolved_at_ns BIGINT
);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
            tracing::debug!(version = migration.version, "applied warehouse migration");
        }
    }

    Ok(())
}

/// Versions recorded in `schema_migrations`, oldest first.
pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}
