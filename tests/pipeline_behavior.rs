//! Behavior-driven tests for the ingestion pipeline end to end: quality
//! verdicts, the gap ledger, conflict resolution and source deactivation.

use std::sync::Arc;
use std::time::Duration;

use tickpipe_core::adapters::SimulatedSource;
use tickpipe_core::config::{InstrumentConfig, PipelineConfig};
use tickpipe_core::ledger::SeriesKey;
use tickpipe_core::quality::DiagnosticCode;
use tickpipe_core::realtime::RealtimeConfig;
use tickpipe_core::retry::RetryPolicy;
use tickpipe_core::storage::{JobStore, MemoryStore, StorageGateway};
use tickpipe_core::{
    AdapterRegistry, AssetClass, Granularity, InstrumentId, JobState, Outcome, Pipeline,
    PipelineStorage, PriorityClass, SourceAdapter, SourceId, Symbol, TimeWindow, UtcDateTime,
};
use tokio::sync::watch;

fn source(id: &str) -> SourceId {
    SourceId::parse(id).expect("source")
}

fn btc() -> InstrumentId {
    InstrumentId::new("BTC-USD", AssetClass::Crypto, "COINBASE").expect("id")
}

fn day(date: &str) -> UtcDateTime {
    UtcDateTime::parse(&format!("{date}T00:00:00Z")).expect("ts")
}

fn days(start: &str, end: &str) -> TimeWindow {
    TimeWindow::new(day(start), day(end)).expect("window")
}

fn config(priority: &[&str]) -> PipelineConfig {
    PipelineConfig {
        source_priority: priority.iter().map(|id| source(id)).collect(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        },
        ..PipelineConfig::default()
    }
}

/// Wires `adapters` in order as the crypto route over one in-memory store.
fn pipeline(
    config: PipelineConfig,
    adapters: Vec<SimulatedSource>,
    store: &Arc<MemoryStore>,
) -> Pipeline {
    let mut registry = AdapterRegistry::new();
    let mut route = Vec::new();
    for adapter in adapters {
        route.push(adapter.id().clone());
        registry.register(Arc::new(adapter)).expect("register");
    }
    registry.route(AssetClass::Crypto, route).expect("route");
    Pipeline::assemble(config, registry, PipelineStorage::memory(store.clone())).expect("assemble")
}

// =============================================================================
// Pipeline: Gap Detection and the Watermark
// =============================================================================

#[tokio::test]
async fn when_two_of_one_hundred_daily_bars_are_missing_then_batch_warns_and_watermark_stops_at_the_gap()
{
    // Given: A source that omits 2024-02-01 and 2024-02-02 from a 100-day window
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha"))
        .fixed_close(100.0)
        .missing(day("2024-02-01"))
        .missing(day("2024-02-02"))
        .build();
    let pipeline = pipeline(config(&["alpha"]), vec![alpha], &store);
    pipeline.start().await.expect("start");
    let window = days("2024-01-01", "2024-04-10");

    // When: The window is backfilled
    let id = pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    // Then: 98 bars are stored under a WARN verdict
    assert_eq!(
        pipeline.scheduler().job(id).expect("job").state,
        JobState::Succeeded
    );
    let key = SeriesKey::new(btc(), Granularity::OneDay);
    let stored = pipeline
        .manager()
        .resolved_range(&key, window)
        .await
        .expect("range");
    assert_eq!(stored.len(), 98);

    let audit = store.audit_trail(&btc()).await.expect("audit");
    let first = audit.first().expect("warned batch is audited");
    assert_eq!(first.verdict.outcome, Outcome::Warn);
    assert!(first.verdict.has(DiagnosticCode::GapsDetected));

    // And: One two-day gap is open and the watermark stops before it
    let gaps = pipeline.ledger().open_gaps(&key);
    assert_eq!(gaps.len(), 1);
    assert_eq!(gaps[0].start, day("2024-02-01"));
    assert_eq!(gaps[0].end, day("2024-02-03"));
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        Some(day("2024-01-31"))
    );
}

#[tokio::test]
async fn when_an_open_gap_is_filled_from_another_source_then_it_resolves_and_watermark_advances() {
    // Given: The primary source leaves a two-day hole, the secondary has it
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha"))
        .fixed_close(100.0)
        .missing(day("2024-02-01"))
        .missing(day("2024-02-02"))
        .build();
    let beta = SimulatedSource::builder(source("beta"))
        .fixed_close(100.0)
        .build();
    let pipeline = pipeline(config(&["alpha", "beta"]), vec![alpha, beta], &store);
    pipeline.start().await.expect("start");
    let window = days("2024-01-01", "2024-04-10");
    pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;
    let key = SeriesKey::new(btc(), Granularity::OneDay);
    assert_eq!(pipeline.ledger().open_gaps(&key).len(), 1);

    // When: The gap window is fetched from the secondary source
    pipeline
        .scheduler()
        .enqueue_from(
            source("beta"),
            btc(),
            days("2024-02-01", "2024-02-03"),
            Granularity::OneDay,
            PriorityClass::GapClose,
        )
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    // Then: The gap is resolved and the watermark covers the whole window
    assert!(pipeline.ledger().open_gaps(&key).is_empty());
    let resolved = pipeline.ledger().resolved_gaps(&key);
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].resolved_at.is_some());
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        Some(day("2024-04-09"))
    );
    assert_eq!(
        pipeline
            .manager()
            .resolved_range(&key, window)
            .await
            .expect("range")
            .len(),
        100
    );
}

#[tokio::test]
async fn when_an_older_window_arrives_late_then_watermark_never_moves_backwards() {
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha")).fixed_close(100.0).build();
    let pipeline = pipeline(config(&["alpha"]), vec![alpha], &store);
    pipeline.start().await.expect("start");
    let key = SeriesKey::new(btc(), Granularity::OneDay);

    pipeline
        .backfill(btc(), days("2024-01-01", "2024-01-11"), Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        Some(day("2024-01-10"))
    );

    pipeline
        .backfill(btc(), days("2023-12-01", "2023-12-11"), Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    assert_eq!(store.record_count(), 20);
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        Some(day("2024-01-10"))
    );
}

// =============================================================================
// Pipeline: Outliers
// =============================================================================

#[tokio::test]
async fn when_a_bar_spikes_against_its_history_then_the_batch_warns_and_the_bar_is_kept() {
    // Given: A month of ordinary noisy history
    let store = Arc::new(MemoryStore::new());
    let spiked = day("2024-02-05");
    let alpha = SimulatedSource::builder(source("alpha"))
        .spike(spiked, 3.0)
        .build();
    let pipeline = pipeline(config(&["alpha"]), vec![alpha], &store);
    pipeline.start().await.expect("start");
    pipeline
        .backfill(btc(), days("2024-01-01", "2024-02-01"), Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    // When: The next window tripled its close on Feb 5
    let window = days("2024-02-01", "2024-02-11");
    let id = pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    // Then: The batch is written under a WARN verdict naming the spiked bar
    assert_eq!(
        pipeline.scheduler().job(id).expect("job").state,
        JobState::Succeeded
    );
    assert_eq!(store.record_count(), 41);

    let audit = store.audit_trail(&btc()).await.expect("audit");
    let warned = audit
        .iter()
        .find(|entry| entry.request.window == window)
        .expect("spiked batch is audited");
    assert_eq!(warned.verdict.outcome, Outcome::Warn);
    assert!(warned
        .verdict
        .diagnostics
        .iter()
        .any(|diagnostic| diagnostic.code == DiagnosticCode::Outlier
            && diagnostic.ts == Some(spiked)));

    // And: The spiked close is stored as delivered
    let key = SeriesKey::new(btc(), Granularity::OneDay);
    let stored = pipeline
        .manager()
        .resolved_range(&key, window)
        .await
        .expect("range");
    let close = |ts: UtcDateTime| {
        stored
            .iter()
            .find(|record| record.ts == ts)
            .map(|record| record.reference_price())
            .expect("stored bar")
    };
    assert!(close(spiked) > 2.0 * close(day("2024-02-04")));
}

// =============================================================================
// Pipeline: Idempotence and Conflict Resolution
// =============================================================================

#[tokio::test]
async fn when_the_same_window_is_backfilled_twice_then_stored_state_is_unchanged() {
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha")).build();
    let pipeline = pipeline(config(&["alpha"]), vec![alpha], &store);
    pipeline.start().await.expect("start");
    let key = SeriesKey::new(btc(), Granularity::OneDay);
    let window = days("2024-01-01", "2024-01-11");

    pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;
    let first = pipeline
        .manager()
        .resolved_range(&key, window)
        .await
        .expect("range");
    let watermark = pipeline.ledger().watermark(&key);

    pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    let second = pipeline
        .manager()
        .resolved_range(&key, window)
        .await
        .expect("range");
    assert_eq!(store.record_count(), 10);
    assert_eq!(first.len(), second.len());
    assert!(first
        .iter()
        .zip(&second)
        .all(|(left, right)| left.ts == right.ts && left.same_payload(right)));
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        watermark.map(|w| w.last_confirmed)
    );
    assert_eq!(pipeline.scheduler().summary().succeeded, 2);
}

#[tokio::test]
async fn when_sources_disagree_then_the_higher_ranked_close_wins_and_the_batch_warns() {
    // Given: alpha says 101.00, beta says 101.05, alpha ranks first
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha")).fixed_close(101.00).build();
    let beta = SimulatedSource::builder(source("beta")).fixed_close(101.05).build();
    let pipeline = pipeline(config(&["alpha", "beta"]), vec![alpha, beta], &store);
    pipeline.start().await.expect("start");
    let window = days("2024-01-01", "2024-01-06");

    // When: Both sources deliver the same window
    pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;
    pipeline
        .scheduler()
        .enqueue_from(
            source("beta"),
            btc(),
            window,
            Granularity::OneDay,
            PriorityClass::Backfill,
        )
        .await
        .expect("enqueue");
    pipeline.run_until_idle().await;

    // Then: Both are kept, alpha's value is the resolved one
    assert_eq!(store.record_count(), 10);
    let key = SeriesKey::new(btc(), Granularity::OneDay);
    let resolved = pipeline
        .manager()
        .resolved_range(&key, window)
        .await
        .expect("range");
    assert_eq!(resolved.len(), 5);
    assert!(resolved.iter().all(|record| record.source == source("alpha")));
    assert!(resolved
        .iter()
        .all(|record| (record.reference_price() - 101.00).abs() < 1e-9));

    // And: beta's batch was flagged for diverging
    let audit = store.audit_trail(&btc()).await.expect("audit");
    let flagged = audit
        .iter()
        .find(|entry| entry.request.source == source("beta"))
        .expect("beta batch audited");
    assert_eq!(flagged.verdict.outcome, Outcome::Warn);
    assert!(flagged.verdict.has(DiagnosticCode::SourceDivergence));
    assert_eq!(flagged.verdict.divergences.len(), 5);
}

// =============================================================================
// Pipeline: Permanent Failures
// =============================================================================

#[tokio::test]
async fn when_a_symbol_is_unknown_then_the_pair_is_deactivated_and_other_work_continues() {
    // Given: A source that does not know ZZZZ
    let store = Arc::new(MemoryStore::new());
    let alpha = SimulatedSource::builder(source("alpha"))
        .unknown_symbol(Symbol::parse("ZZZZ").expect("symbol"))
        .build();
    let pipeline = pipeline(config(&["alpha"]), vec![alpha], &store);
    pipeline.start().await.expect("start");
    let zzzz = InstrumentId::new("ZZZZ", AssetClass::Crypto, "COINBASE").expect("id");
    let window = days("2024-01-01", "2024-01-11");

    // When: Both instruments are backfilled
    let failed = pipeline
        .backfill(zzzz.clone(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    let ok = pipeline
        .backfill(btc(), window, Granularity::OneDay)
        .await
        .expect("enqueue");
    let report = pipeline.run_until_idle().await;

    // Then: ZZZZ fails once without retry and the pair is deactivated
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    let job = pipeline.scheduler().job(failed).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(
        pipeline.scheduler().job(ok).expect("job").state,
        JobState::Succeeded
    );

    let deactivations = store.deactivations().await.expect("deactivations");
    assert_eq!(deactivations.len(), 1);
    assert_eq!(deactivations[0].instrument, zzzz);
    assert_eq!(deactivations[0].source, source("alpha"));

    // And: New work for the pair is refused
    let error = pipeline
        .backfill(zzzz, window, Granularity::OneDay)
        .await
        .expect_err("no active source");
    assert_eq!(error.code(), "scheduler.no_active_source");
}

// =============================================================================
// Pipeline: Realtime
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_a_live_slot_is_skipped_then_a_realtime_backfill_closes_the_gap() {
    // Given: A live 1m feed that skips its third bar
    let store = Arc::new(MemoryStore::new());
    let start = UtcDateTime::parse("2024-03-01T00:00:00Z").expect("ts");
    let live = SimulatedSource::builder(source("live"))
        .realtime(Granularity::OneMinute, start, Duration::from_secs(1))
        .skip_realtime(2)
        .build();
    let config = PipelineConfig {
        realtime: RealtimeConfig {
            enabled: true,
            batch_size: 4,
            flush_interval: Duration::from_secs(60),
            ..RealtimeConfig::default()
        },
        instruments: vec![InstrumentConfig {
            symbol: String::from("BTC-USD"),
            asset_class: AssetClass::Crypto,
            exchange: String::from("COINBASE"),
            granularity: Granularity::OneMinute,
            lookback_days: 1,
            realtime: true,
        }],
        ..config(&["live"])
    };
    let pipeline = pipeline(config, vec![live], &store);
    pipeline.start().await.expect("start");
    let feed = Arc::clone(pipeline.feed().expect("realtime feed"));

    // When: Four bars arrive and the feed is stopped
    let (stop, shutdown) = watch::channel(false);
    let runner = tokio::spawn(async move { feed.run(shutdown).await });
    tokio::time::sleep(Duration::from_millis(4_500)).await;
    stop.send(true).expect("stop");
    let stats = runner.await.expect("join");

    // Then: The skipped slot was queued at realtime priority
    assert_eq!(stats.received, 4);
    assert_eq!(stats.live_gaps, 1);
    assert_eq!(stats.backfill_jobs, 1);
    let jobs = pipeline.scheduler().jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].priority.class, PriorityClass::Realtime);

    // And: Running it fills the gap
    let report = pipeline.run_until_idle().await;
    assert_eq!(report.succeeded, 1);
    let key = SeriesKey::new(btc(), Granularity::OneMinute);
    assert!(pipeline.ledger().open_gaps(&key).is_empty());
    assert_eq!(
        pipeline.ledger().watermark(&key).map(|w| w.last_confirmed),
        Some(start.saturating_add(time::Duration::minutes(4)))
    );
}
