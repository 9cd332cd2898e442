//! Live feed supervision: subscribes per source, micro-batches records
//! through the quality engine and data manager, and reacts to live gaps.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::adapters::{FetchError, RecordStream};
use crate::ledger::SeriesKey;
use crate::manager::{DataManager, ManagerError, WriteReport};
use crate::quality::{BatchRequest, QualityEngine};
use crate::registry::AdapterRegistry;
use crate::retry::RetryPolicy;
use crate::scheduler::{PriorityClass, Scheduler};
use crate::{DataKind, InstrumentId, Record, SourceId, TimeWindow, UtcDateTime};

/// What happens to gaps seen in the live stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Enqueue realtime-priority historical jobs for each live gap.
    #[default]
    AutoBackfill,
    /// Record the gap in the ledger only.
    Manual,
}

impl GapPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoBackfill => "auto_backfill",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub gap_policy: GapPolicy,
    /// Records buffered per series before a batch is validated.
    pub batch_size: usize,
    #[serde(with = "crate::config::duration_ms", rename = "flush_interval_ms")]
    pub flush_interval: Duration,
    #[serde(with = "crate::config::duration_ms", rename = "reconnect_base_ms")]
    pub reconnect_base: Duration,
    #[serde(with = "crate::config::duration_ms", rename = "reconnect_max_ms")]
    pub reconnect_max: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gap_policy: GapPolicy::AutoBackfill,
            batch_size: 64,
            flush_interval: Duration::from_secs(1),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Counters across every subscription of a feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedStats {
    pub received: usize,
    pub batches: usize,
    pub written: usize,
    pub rejected: usize,
    pub stream_errors: usize,
    pub live_gaps: usize,
    pub backfill_jobs: usize,
    pub reconnects: usize,
}

enum StreamEnd {
    Disconnected,
    Fatal,
    Shutdown,
}

/// Supervises one realtime subscription per source.
///
/// Batches take the same per-instrument gate as scheduled jobs, so live
/// writes never interleave with a historical write for the instrument.
pub struct RealtimeFeed {
    registry: Arc<AdapterRegistry>,
    manager: Arc<DataManager>,
    engine: Arc<QualityEngine>,
    scheduler: Arc<Scheduler>,
    config: RealtimeConfig,
    instruments: Vec<InstrumentId>,
    last_seen: Mutex<HashMap<SeriesKey, UtcDateTime>>,
    stats: Mutex<FeedStats>,
}

impl RealtimeFeed {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        manager: Arc<DataManager>,
        engine: Arc<QualityEngine>,
        scheduler: Arc<Scheduler>,
        config: RealtimeConfig,
        instruments: Vec<InstrumentId>,
    ) -> Self {
        Self {
            registry,
            manager,
            engine,
            scheduler,
            config,
            instruments,
            last_seen: Mutex::new(HashMap::new()),
            stats: Mutex::new(FeedStats::default()),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn stats(&self) -> FeedStats {
        *lock(&self.stats)
    }

    /// Instruments grouped by the first routed source still active for them.
    pub fn subscriptions(&self) -> BTreeMap<SourceId, Vec<InstrumentId>> {
        let mut grouped: BTreeMap<SourceId, Vec<InstrumentId>> = BTreeMap::new();
        for instrument in &self.instruments {
            let source = self
                .registry
                .sources_for(instrument.asset_class)
                .into_iter()
                .find(|source| !self.scheduler.is_deactivated(instrument, source));
            match source {
                Some(source) => grouped.entry(source).or_default().push(instrument.clone()),
                None => tracing::warn!(instrument = %instrument, "no active realtime source"),
            }
        }
        grouped
    }

    /// Runs every subscription until `shutdown` turns true. Buffered records
    /// are flushed before returning.
    pub async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> FeedStats {
        let mut supervisors = JoinSet::new();
        for (source, instruments) in self.subscriptions() {
            let feed = Arc::clone(self);
            let shutdown = shutdown.clone();
            supervisors.spawn(async move { feed.supervise(source, instruments, shutdown).await });
        }
        while let Some(joined) = supervisors.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "realtime supervisor aborted");
            }
        }
        self.stats()
    }

    async fn supervise(
        &self,
        source: SourceId,
        instruments: Vec<InstrumentId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(adapter) = self.registry.get(&source) else {
            tracing::error!(source = %source, "realtime source is not registered");
            return;
        };
        let backoff = RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: self.config.reconnect_base,
            max_delay: self.config.reconnect_max,
            jitter: 0.2,
        };

        let mut failures = 0_u32;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match adapter.subscribe_realtime(&instruments).await {
                Ok(stream) => {
                    failures = 0;
                    tracing::info!(source = %source, instruments = instruments.len(), "realtime subscribed");
                    match self.pump(&source, stream, &mut shutdown).await {
                        StreamEnd::Shutdown | StreamEnd::Fatal => return,
                        StreamEnd::Disconnected => {
                            tracing::warn!(source = %source, "realtime stream disconnected");
                        }
                    }
                }
                Err(error @ FetchError::Permanent { .. }) => {
                    tracing::error!(source = %source, code = error.code(), error = %error, "realtime subscription refused");
                    return;
                }
                Err(error) => {
                    tracing::warn!(source = %source, code = error.code(), error = %error, "realtime subscribe failed");
                }
            }

            failures = failures.saturating_add(1);
            let delay = backoff.delay(failures, None);
            lock(&self.stats).reconnects += 1;
            tracing::info!(source = %source, delay_ms = delay.as_millis() as u64, "realtime reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn pump(
        &self,
        source: &SourceId,
        mut stream: RecordStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let mut buffers: BTreeMap<SeriesKey, Vec<Record>> = BTreeMap::new();
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                self.flush_all(source, &mut buffers).await;
                return StreamEnd::Shutdown;
            }

            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(record)) => {
                        lock(&self.stats).received += 1;
                        let key = SeriesKey::new(record.instrument.clone(), record.granularity);
                        let buffer = buffers.entry(key.clone()).or_default();
                        buffer.push(record);
                        if buffer.len() >= self.config.batch_size {
                            if let Some(records) = buffers.remove(&key) {
                                self.flush(source, key, records).await;
                            }
                        }
                    }
                    Some(Err(error)) => {
                        lock(&self.stats).stream_errors += 1;
                        tracing::warn!(source = %source, code = error.code(), error = %error, "realtime stream error");
                        if matches!(error, FetchError::Permanent { .. }) {
                            self.flush_all(source, &mut buffers).await;
                            return StreamEnd::Fatal;
                        }
                    }
                    None => {
                        self.flush_all(source, &mut buffers).await;
                        return StreamEnd::Disconnected;
                    }
                },
                _ = ticker.tick() => {
                    self.flush_all(source, &mut buffers).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        self.flush_all(source, &mut buffers).await;
                        return StreamEnd::Shutdown;
                    }
                }
            }
        }
    }

    async fn flush_all(&self, source: &SourceId, buffers: &mut BTreeMap<SeriesKey, Vec<Record>>) {
        for (key, records) in std::mem::take(buffers) {
            if !records.is_empty() {
                self.flush(source, key, records).await;
            }
        }
    }

    /// Window covered by a batch: from the slot after the last record seen
    /// for the series through the newest record, so skipped slots surface
    /// as gaps.
    fn batch_window(&self, key: &SeriesKey, records: &[Record]) -> Option<TimeWindow> {
        let first = records.iter().map(|record| record.ts).min()?;
        let last = records.iter().map(|record| record.ts).max()?;
        let step = key.step();
        let previous = lock(&self.last_seen).get(key).copied().or_else(|| {
            self.manager
                .ledger()
                .watermark(key)
                .map(|watermark| watermark.last_confirmed)
        });
        let start = match previous {
            Some(previous) if previous < first => previous.saturating_add(step),
            _ => first,
        };
        TimeWindow::new(start.min(first), last.saturating_add(step)).ok()
    }

    /// Validates records in arrival order so the engine can flag inversions.
    async fn flush(&self, source: &SourceId, key: SeriesKey, records: Vec<Record>) {
        let Some(window) = self.batch_window(&key, &records) else {
            return;
        };
        let newest = records.iter().map(|record| record.ts).max();
        let request = BatchRequest {
            instrument: key.instrument.clone(),
            source: source.clone(),
            window,
            granularity: key.granularity,
            kind: DataKind::Realtime,
        };

        let written = {
            let _gate = self.scheduler.gates().enter(&key.instrument).await;
            let context = match self
                .manager
                .quality_context(&request, self.engine.config().lookback)
                .await
            {
                Ok(context) => context,
                Err(error) => {
                    tracing::error!(series = %key, code = error.code(), error = %error, "realtime context unavailable");
                    return;
                }
            };
            let batch = self.engine.validate(&request, records, None, &context);
            self.manager.write(batch).await
        };
        lock(&self.stats).batches += 1;

        match written {
            Ok(report) => {
                if let Some(newest) = newest {
                    let mut last_seen = lock(&self.last_seen);
                    let entry = last_seen.entry(key.clone()).or_insert(newest);
                    *entry = (*entry).max(newest);
                }
                lock(&self.stats).written += report.written;
                self.handle_live_gaps(&report).await;
            }
            Err(ManagerError::QualityRejected { batch_id, codes }) => {
                lock(&self.stats).rejected += 1;
                tracing::warn!(series = %key, batch_id = %batch_id, codes = %codes, "realtime batch rejected");
            }
            Err(ManagerError::Storage(error)) => {
                tracing::error!(series = %key, code = error.code(), error = %error, "realtime batch not written");
            }
        }
    }

    async fn handle_live_gaps(&self, report: &WriteReport) {
        if report.new_gaps.is_empty() {
            if report.changed_gaps() {
                self.scheduler
                    .handle_write_report(report, None, PriorityClass::Realtime)
                    .await;
            }
            return;
        }

        lock(&self.stats).live_gaps += report.new_gaps.len();
        match self.config.gap_policy {
            GapPolicy::AutoBackfill => {
                let created = self
                    .scheduler
                    .handle_write_report(report, None, PriorityClass::Realtime)
                    .await;
                lock(&self.stats).backfill_jobs += created;
                tracing::info!(series = %report.series, gaps = report.new_gaps.len(), jobs = created, "live gaps queued for backfill");
            }
            GapPolicy::Manual => {
                tracing::info!(
                    series = %report.series,
                    gaps = report.new_gaps.len(),
                    "live gaps recorded for manual reconciliation"
                );
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SimulatedSource;
    use crate::ledger::Ledger;
    use crate::manager::SourceRanking;
    use crate::quality::{DiagnosticCode, QualityConfig};
    use crate::scheduler::JobState;
    use crate::storage::{MemoryStore, StorageGateway};
    use crate::{AssetClass, Granularity};

    fn source() -> SourceId {
        SourceId::parse("live").expect("source")
    }

    fn instrument() -> InstrumentId {
        InstrumentId::new("ETH-USD", AssetClass::Crypto, "COINBASE").expect("id")
    }

    fn start() -> UtcDateTime {
        UtcDateTime::parse("2024-03-01T00:00:00Z").expect("ts")
    }

    fn feed(
        adapter: SimulatedSource,
        policy: GapPolicy,
    ) -> (Arc<RealtimeFeed>, Arc<Scheduler>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter)).expect("register");
        let registry = Arc::new(registry);
        let manager = Arc::new(DataManager::new(
            store.clone(),
            Arc::new(Ledger::new()),
            store.clone(),
            SourceRanking::new(vec![source()]),
        ));
        let engine = Arc::new(QualityEngine::new(QualityConfig::default()));
        let scheduler = Arc::new(
            Scheduler::builder(registry.clone(), manager.clone(), engine.clone(), store.clone())
                .build(),
        );
        let config = RealtimeConfig {
            enabled: true,
            gap_policy: policy,
            batch_size: 4,
            flush_interval: Duration::from_secs(60),
            ..RealtimeConfig::default()
        };
        let feed = RealtimeFeed::new(registry, manager, engine, scheduler.clone(), config, vec![instrument()]);
        (Arc::new(feed), scheduler, store)
    }

    fn adapter() -> SimulatedSource {
        SimulatedSource::builder(source())
            .realtime(Granularity::OneMinute, start(), Duration::from_secs(1))
            .skip_realtime(2)
            .disconnect_after(5)
            .build()
    }

    #[test]
    fn gap_policy_uses_snake_case_labels() {
        let config: RealtimeConfig =
            toml::from_str("gap_policy = \"manual\"\nbatch_size = 8").expect("parse");
        assert_eq!(config.gap_policy, GapPolicy::Manual);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_live_slot_queues_realtime_backfill() {
        let (feed, scheduler, _) = feed(adapter(), GapPolicy::AutoBackfill);
        let (stop, shutdown) = watch::channel(false);

        let runner = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.send(true).expect("stop");
        let stats = runner.await.expect("join");

        assert_eq!(stats.received, 4);
        assert_eq!(stats.live_gaps, 1);
        assert_eq!(stats.backfill_jobs, 1);
        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority.class, PriorityClass::Realtime);
        assert_eq!(jobs[0].state, JobState::Pending);
        assert_eq!(jobs[0].window.start(), start().saturating_add(time::Duration::minutes(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_policy_only_records_the_gap() {
        let (feed, scheduler, _) = feed(adapter(), GapPolicy::Manual);
        let (stop, shutdown) = watch::channel(false);

        let runner = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.send(true).expect("stop");
        let stats = runner.await.expect("join");

        assert_eq!(stats.live_gaps, 1);
        assert_eq!(stats.backfill_jobs, 0);
        assert!(scheduler.jobs().is_empty());
        let key = SeriesKey::new(instrument(), Granularity::OneMinute);
        assert_eq!(scheduler.manager().ledger().open_gaps(&key).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn when_a_live_bar_arrives_late_then_the_batch_is_flagged_out_of_order() {
        // Given: Minute 1 is delivered after minute 2 within the first batch
        let adapter = SimulatedSource::builder(source())
            .realtime(Granularity::OneMinute, start(), Duration::from_secs(1))
            .delay_realtime(1)
            .disconnect_after(5)
            .build();
        let (feed, _, store) = feed(adapter, GapPolicy::AutoBackfill);
        let (stop, shutdown) = watch::channel(false);

        // When: The feed runs through five emissions

        let runner = {
            let feed = Arc::clone(&feed);
            tokio::spawn(async move { feed.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.send(true).expect("stop");
        let stats = runner.await.expect("join");

        // Then: The inversion is audited and every bar is stored
        assert_eq!(stats.received, 5);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.live_gaps, 0);
        let audit = store.audit_trail(&instrument()).await.expect("audit");
        assert!(audit
            .iter()
            .any(|entry| entry.verdict.has(DiagnosticCode::OutOfOrder)));
        let key = SeriesKey::new(instrument(), Granularity::OneMinute);
        let window = TimeWindow::new(start(), start().saturating_add(time::Duration::minutes(5)))
            .expect("window");
        let stored = store.query_range(&key, window).await.expect("query");
        assert_eq!(stored.len(), 5);
    }
}
