//! Behavior-driven tests for the DuckDB-backed store: record upserts, job
//! history, the gap ledger and source deactivations.

use tempfile::TempDir;
use tickpipe_core::ledger::{GapInterval, LedgerSnapshot, SeriesKey, Watermark};
use tickpipe_core::scheduler::Priority;
use tickpipe_core::storage::{
    ConflictPolicy, JobStore, LedgerStore, StorageGateway, WarehouseStore,
};
use tickpipe_core::{
    AssetClass, FetchJob, Granularity, InstrumentId, JobState, PriorityClass, Record, SourceId,
    TimeWindow, UtcDateTime,
};
use tickpipe_warehouse::{Warehouse, WarehouseConfig};

fn open(home: &TempDir) -> WarehouseStore {
    let config = WarehouseConfig {
        home: home.path().to_path_buf(),
        db_path: home.path().join("data").join("tickpipe.duckdb"),
        max_pool_size: 2,
    };
    WarehouseStore::new(Warehouse::open(config).expect("open warehouse"))
}

fn aapl() -> InstrumentId {
    InstrumentId::new("AAPL", AssetClass::Equity, "XNAS").expect("id")
}

fn source(id: &str) -> SourceId {
    SourceId::parse(id).expect("source")
}

fn day(date: &str) -> UtcDateTime {
    UtcDateTime::parse(&format!("{date}T00:00:00Z")).expect("ts")
}

fn bar(date: &str, close: f64) -> Record {
    Record::bar(
        aapl(),
        Granularity::OneDay,
        day(date),
        close - 1.0,
        close + 1.0,
        close - 2.0,
        close,
        1_000.0,
        source("alpha"),
    )
}

fn january() -> TimeWindow {
    TimeWindow::new(day("2024-01-01"), day("2024-02-01")).expect("window")
}

// =============================================================================
// Warehouse: Records
// =============================================================================

#[tokio::test]
async fn when_the_same_records_are_written_twice_then_nothing_changes() {
    // Given: An empty warehouse
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);
    let records = vec![
        bar("2024-01-02", 185.0),
        bar("2024-01-03", 184.0),
        bar("2024-01-04", 182.0),
    ];

    // When: The batch is upserted twice
    let first = store
        .upsert(&records, ConflictPolicy::ReplaceIfChanged)
        .await
        .expect("first upsert");
    let second = store
        .upsert(&records, ConflictPolicy::ReplaceIfChanged)
        .await
        .expect("second upsert");

    // Then: Only the first write changes rows
    assert_eq!(first, 3);
    assert_eq!(second, 0);
    assert_eq!(store.warehouse().record_count().expect("count"), 3);

    let key = SeriesKey::new(aapl(), Granularity::OneDay);
    let stored = store.query_range(&key, january()).await.expect("query");
    assert_eq!(stored.len(), 3);
    assert!(stored.windows(2).all(|pair| pair[0].ts < pair[1].ts));
    assert!(stored
        .iter()
        .zip(&records)
        .all(|(left, right)| left.same_payload(right)));
}

#[tokio::test]
async fn when_a_stored_record_changes_then_the_policy_decides_whether_it_is_replaced() {
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);
    store
        .upsert(&[bar("2024-01-02", 185.0)], ConflictPolicy::ReplaceIfChanged)
        .await
        .expect("seed");

    let kept = store
        .upsert(&[bar("2024-01-02", 190.0)], ConflictPolicy::KeepExisting)
        .await
        .expect("keep existing");
    assert_eq!(kept, 0);

    let replaced = store
        .upsert(&[bar("2024-01-02", 190.0)], ConflictPolicy::ReplaceIfChanged)
        .await
        .expect("replace");
    assert_eq!(replaced, 1);

    let key = SeriesKey::new(aapl(), Granularity::OneDay);
    let stored = store.query_range(&key, january()).await.expect("query");
    assert_eq!(stored.len(), 1);
    assert!(stored[0].same_payload(&bar("2024-01-02", 190.0)));
}

#[tokio::test]
async fn when_records_fall_outside_the_window_then_they_are_not_returned() {
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);
    store
        .upsert(
            &[bar("2023-12-29", 190.0), bar("2024-01-02", 185.0), bar("2024-02-01", 187.0)],
            ConflictPolicy::ReplaceIfChanged,
        )
        .await
        .expect("upsert");

    let key = SeriesKey::new(aapl(), Granularity::OneDay);
    let stored = store.query_range(&key, january()).await.expect("query");

    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ts, day("2024-01-02"));
}

// =============================================================================
// Warehouse: Job History
// =============================================================================

#[tokio::test]
async fn when_a_job_moves_through_its_lifecycle_then_every_transition_is_kept() {
    // Given: A pending job
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);
    let mut job = FetchJob::new(
        aapl(),
        source("alpha"),
        january(),
        Granularity::OneDay,
        Priority::new(PriorityClass::Backfill),
    );
    store.record_transition(&job, None).await.expect("created");

    // When: It runs once, is retried, then succeeds
    for next in [
        JobState::Running,
        JobState::RetryScheduled,
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
    ] {
        if next == JobState::Running {
            job.attempt_count += 1;
        }
        if next == JobState::RetryScheduled {
            job.last_error = Some(String::from("source 'alpha' timed out"));
        }
        let from = job.transition(next).expect("valid transition");
        store
            .record_transition(&job, Some(from))
            .await
            .expect("transition");
    }

    // Then: The history replays the state machine in order
    let history = store.history(job.id).await.expect("history");
    let states: Vec<JobState> = history.iter().map(|transition| transition.to).collect();
    assert_eq!(
        states,
        vec![
            JobState::Pending,
            JobState::Running,
            JobState::RetryScheduled,
            JobState::Pending,
            JobState::Running,
            JobState::Succeeded,
        ]
    );
    assert_eq!(history[0].from, None);
    assert_eq!(history[2].error.as_deref(), Some("source 'alpha' timed out"));

    // And: The latest state is what a restart loads
    let loaded = JobStore::load_all(&store).await.expect("load");
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].state, JobState::Succeeded);
    assert_eq!(loaded[0].attempt_count, 2);

    let counts = store.warehouse().job_counts().expect("counts");
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].state, "SUCCEEDED");
    assert_eq!(counts[0].jobs, 1);
}

#[tokio::test]
async fn when_a_source_is_deactivated_twice_then_the_first_reason_wins() {
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);

    store
        .deactivate(&aapl(), &source("alpha"), "unknown symbol")
        .await
        .expect("first");
    store
        .deactivate(&aapl(), &source("alpha"), "something else")
        .await
        .expect("second");

    let deactivations = store.deactivations().await.expect("load");
    assert_eq!(deactivations.len(), 1);
    assert_eq!(deactivations[0].instrument, aapl());
    assert_eq!(deactivations[0].source, source("alpha"));
    assert_eq!(deactivations[0].reason, "unknown symbol");
}

// =============================================================================
// Warehouse: Gap Ledger and Restart
// =============================================================================

fn snapshot() -> LedgerSnapshot {
    let discovered = day("2024-02-05");
    let gap = |start: &str, end: &str, resolved_at: Option<UtcDateTime>| GapInterval {
        instrument: aapl(),
        granularity: Granularity::OneDay,
        start: day(start),
        end: day(end),
        discovered_at: discovered,
        resolved_at,
    };
    LedgerSnapshot {
        key: SeriesKey::new(aapl(), Granularity::OneDay),
        coverage: vec![
            TimeWindow::new(day("2024-01-01"), day("2024-01-10")).expect("window"),
            TimeWindow::new(day("2024-01-12"), day("2024-02-01")).expect("window"),
        ],
        gaps: vec![
            gap("2024-01-10", "2024-01-12", None),
            gap("2024-01-05", "2024-01-06", Some(day("2024-02-06"))),
        ],
        watermark: Some(Watermark {
            last_confirmed: day("2024-01-09"),
            last_updated_at: discovered,
        }),
    }
}

#[tokio::test]
async fn when_the_warehouse_is_reopened_then_ledger_and_jobs_are_restored() {
    // Given: A saved ledger snapshot and a pending job
    let home = TempDir::new().expect("tempdir");
    let job = FetchJob::new(
        aapl(),
        source("alpha"),
        january(),
        Granularity::OneDay,
        Priority::new(PriorityClass::GapClose),
    );
    {
        let store = open(&home);
        store.save(&snapshot()).await.expect("save ledger");
        store.record_transition(&job, None).await.expect("save job");
    }

    // When: The same database is opened again
    let store = open(&home);

    // Then: Migrations are not reapplied and state survives
    let versions = store.warehouse().schema_versions().expect("versions");
    assert_eq!(
        versions,
        vec!["0001_records", "0002_jobs", "0003_gap_ledger"]
    );

    let ledgers = LedgerStore::load_all(&store).await.expect("ledger");
    assert_eq!(ledgers, vec![snapshot()]);

    let jobs = JobStore::load_all(&store).await.expect("jobs");
    assert_eq!(jobs, vec![job]);

    // And: Only the unresolved gap shows in the review view
    let open_gaps = store.warehouse().open_gaps().expect("open gaps");
    assert_eq!(open_gaps.len(), 1);
    assert_eq!(open_gaps[0].series.symbol, "AAPL");
    assert_eq!(open_gaps[0].start_ns, day("2024-01-10").unix_nanos());
    assert_eq!(open_gaps[0].end_ns, day("2024-01-12").unix_nanos());
}

#[tokio::test]
async fn when_a_gap_is_resolved_then_the_saved_ledger_replaces_the_old_one() {
    let home = TempDir::new().expect("tempdir");
    let store = open(&home);
    store.save(&snapshot()).await.expect("first save");

    let mut resolved = snapshot();
    for gap in &mut resolved.gaps {
        gap.resolved_at.get_or_insert(day("2024-02-07"));
    }
    store.save(&resolved).await.expect("second save");

    assert!(store.warehouse().open_gaps().expect("open gaps").is_empty());
    let ledgers = LedgerStore::load_all(&store).await.expect("ledger");
    assert_eq!(ledgers.len(), 1);
    assert!(ledgers[0].gaps.iter().all(|gap| !gap.is_open()));
}
