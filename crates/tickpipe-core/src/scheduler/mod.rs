//! Fetch job scheduling: priority dispatch over bounded per-source worker
//! pools, retries, circuit breaking and gap-driven prioritization.

mod job;
mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::adapters::{FetchError, SourceAdapter};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::ledger::SeriesKey;
use crate::manager::{DataManager, ManagerError, WriteReport};
use crate::quality::{BatchRequest, QualityEngine};
use crate::registry::AdapterRegistry;
use crate::retry::RetryPolicy;
use crate::storage::{JobStore, JobTransition, StorageError};
use crate::{AssetClass, Granularity, InstrumentId, SourceId, TimeWindow, UtcDateTime};

pub use job::{FetchJob, InvalidTransition, JobId, JobKey, JobState, Priority, PriorityClass};

use queue::JobQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Deadline for one fetch. Expiry is handled as a transient failure.
    #[serde(with = "crate::config::duration_ms", rename = "job_timeout_ms")]
    pub job_timeout: Duration,
    /// Interval between refresh rounds in `run_forever`.
    #[serde(with = "crate::config::duration_ms", rename = "refresh_interval_ms")]
    pub refresh_interval: Duration,
    #[serde(with = "crate::config::duration_ms", rename = "idle_poll_ms")]
    pub idle_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(300),
            idle_poll: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown source '{0}'")]
    UnknownSource(SourceId),

    #[error("no active source serves {instrument}")]
    NoActiveSource { instrument: InstrumentId },

    #[error("source '{source_id}' is deactivated for {instrument}")]
    Deactivated {
        instrument: InstrumentId,
        source_id: SourceId,
    },

    #[error("source '{source_id}' does not serve asset class '{asset_class}'")]
    Unsupported {
        source_id: SourceId,
        asset_class: AssetClass,
    },

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SchedulerError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownSource(_) => "scheduler.unknown_source",
            Self::NoActiveSource { .. } => "scheduler.no_active_source",
            Self::Deactivated { .. } => "scheduler.deactivated",
            Self::Unsupported { .. } => "scheduler.unsupported",
            Self::UnknownJob(_) => "scheduler.unknown_job",
            Self::InvalidTransition(_) => "scheduler.invalid_transition",
            Self::Storage(error) => error.code(),
        }
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub pending: usize,
    pub running: usize,
    pub retry_scheduled: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobSummary {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a FetchJob>) -> Self {
        let mut summary = Self::default();
        for job in jobs {
            summary.add(job.state, 1);
        }
        summary
    }

    pub fn add(&mut self, state: JobState, count: usize) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::RetryScheduled => &mut self.retry_scheduled,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
        };
        *slot += count;
    }

    pub const fn total(&self) -> usize {
        self.pending + self.running + self.retry_scheduled + self.succeeded + self.failed
    }

    pub const fn active(&self) -> usize {
        self.pending + self.running + self.retry_scheduled
    }

    pub const fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// What one run of the dispatch loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Gap-close jobs created from write reports.
    pub gap_jobs: usize,
}

/// Series kept fresh by `run_forever`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTarget {
    pub instrument: InstrumentId,
    pub granularity: Granularity,
    /// Window start used before the series has a watermark.
    pub lookback: time::Duration,
}

/// One async mutex per instrument. Holding the guard makes the holder the
/// only writer for that instrument.
#[derive(Debug, Default)]
pub struct InstrumentGates {
    gates: Mutex<HashMap<InstrumentId, Arc<tokio::sync::Mutex<()>>>>,
}

impl InstrumentGates {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, instrument: &InstrumentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = lock(&self.gates);
        Arc::clone(gates.entry(instrument.clone()).or_default())
    }

    /// Enters the gate only if nobody holds it.
    pub fn try_enter(&self, instrument: &InstrumentId) -> Option<OwnedMutexGuard<()>> {
        self.gate(instrument).try_lock_owned().ok()
    }

    pub async fn enter(&self, instrument: &InstrumentId) -> OwnedMutexGuard<()> {
        self.gate(instrument).lock_owned().await
    }
}

struct SourceSlot {
    breaker: CircuitBreaker,
    workers: Arc<Semaphore>,
}

enum AttemptResult {
    Written { report: WriteReport, partial: bool },
    Rejected { batch_id: Uuid, codes: String },
    Fetch(FetchError),
    TimedOut,
    Storage(StorageError),
}

type Attempt = (FetchJob, AttemptResult);

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    registry: Arc<AdapterRegistry>,
    manager: Arc<DataManager>,
    engine: Arc<QualityEngine>,
    job_store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    breaker: CircuitBreakerConfig,
    gates: Arc<InstrumentGates>,
    refresh: Vec<RefreshTarget>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Shares instrument gates with another writer such as the realtime feed.
    pub fn gates(mut self, gates: Arc<InstrumentGates>) -> Self {
        self.gates = gates;
        self
    }

    pub fn refresh_targets(mut self, targets: Vec<RefreshTarget>) -> Self {
        self.refresh = targets;
        self
    }

    pub fn build(self) -> Scheduler {
        let slots = self
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                let adapter = self.registry.get(&id)?;
                let workers = adapter.rate_limit_info().max_concurrency.max(1);
                Some((
                    id,
                    SourceSlot {
                        breaker: CircuitBreaker::new(self.breaker),
                        workers: Arc::new(Semaphore::new(workers)),
                    },
                ))
            })
            .collect();

        Scheduler {
            registry: self.registry,
            manager: self.manager,
            engine: self.engine,
            job_store: self.job_store,
            config: self.config,
            retry: self.retry,
            queue: Mutex::new(JobQueue::default()),
            slots,
            gates: self.gates,
            deactivated: Mutex::new(HashSet::new()),
            wake: Notify::new(),
            refresh: self.refresh,
        }
    }
}

/// Owns every [`FetchJob`] and drives it through its state machine.
///
/// Used behind an `Arc`: workers run as tokio tasks holding a clone.
pub struct Scheduler {
    registry: Arc<AdapterRegistry>,
    manager: Arc<DataManager>,
    engine: Arc<QualityEngine>,
    job_store: Arc<dyn JobStore>,
    config: SchedulerConfig,
    retry: RetryPolicy,
    queue: Mutex<JobQueue>,
    slots: HashMap<SourceId, SourceSlot>,
    gates: Arc<InstrumentGates>,
    deactivated: Mutex<HashSet<(InstrumentId, SourceId)>>,
    wake: Notify,
    refresh: Vec<RefreshTarget>,
}

impl Scheduler {
    pub fn builder(
        registry: Arc<AdapterRegistry>,
        manager: Arc<DataManager>,
        engine: Arc<QualityEngine>,
        job_store: Arc<dyn JobStore>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            registry,
            manager,
            engine,
            job_store,
            config: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            gates: Arc::new(InstrumentGates::new()),
            refresh: Vec::new(),
        }
    }

    pub fn gates(&self) -> &Arc<InstrumentGates> {
        &self.gates
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Circuit state of `source`, if it is registered.
    pub fn circuit_state(&self, source: &SourceId) -> Option<crate::circuit_breaker::CircuitState> {
        self.slots.get(source).map(|slot| slot.breaker.state())
    }

    pub fn is_deactivated(&self, instrument: &InstrumentId, source: &SourceId) -> bool {
        lock(&self.deactivated).contains(&(instrument.clone(), source.clone()))
    }

    /// Queues a historical fetch on the first routed source still active for
    /// the instrument. Returns the id of an identical active job if one exists.
    pub async fn enqueue(
        &self,
        instrument: InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
        priority: PriorityClass,
    ) -> Result<JobId, SchedulerError> {
        let source = self.active_source(&instrument)?;
        self.enqueue_from(source, instrument, window, granularity, priority)
            .await
    }

    /// Queues a historical fetch on an explicit source.
    pub async fn enqueue_from(
        &self,
        source: SourceId,
        instrument: InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
        priority: PriorityClass,
    ) -> Result<JobId, SchedulerError> {
        let adapter = self
            .registry
            .get(&source)
            .ok_or_else(|| SchedulerError::UnknownSource(source.clone()))?;
        if !adapter.supports(instrument.asset_class) {
            return Err(SchedulerError::Unsupported {
                source_id: source,
                asset_class: instrument.asset_class,
            });
        }
        if self.is_deactivated(&instrument, &source) {
            return Err(SchedulerError::Deactivated {
                instrument,
                source_id: source,
            });
        }

        let job = FetchJob::new(instrument, source, window, granularity, Priority::new(priority));
        let key = job.key();
        if let Err(existing) = lock(&self.queue).reserve(key.clone(), job.id) {
            tracing::debug!(job_id = %existing, "identical job already active");
            return Ok(existing);
        }

        // The key stays reserved while the job is persisted, so a concurrent
        // identical enqueue returns this id without writing its own row.
        if let Err(error) = self.job_store.record_transition(&job, None).await {
            lock(&self.queue).release(&key, job.id);
            return Err(error.into());
        }
        let id = job.id;
        tracing::info!(
            job_id = %id,
            instrument = %job.instrument,
            source = %job.source,
            window = %job.window,
            priority = %job.priority,
            "job enqueued"
        );
        lock(&self.queue).upsert(job);
        self.wake.notify_one();
        Ok(id)
    }

    fn active_source(&self, instrument: &InstrumentId) -> Result<SourceId, SchedulerError> {
        let deactivated = lock(&self.deactivated);
        self.registry
            .sources_for(instrument.asset_class)
            .into_iter()
            .find(|source| !deactivated.contains(&(instrument.clone(), source.clone())))
            .ok_or_else(|| SchedulerError::NoActiveSource {
                instrument: instrument.clone(),
            })
    }

    pub fn job(&self, id: JobId) -> Option<FetchJob> {
        lock(&self.queue).get(id).cloned()
    }

    /// Active jobs and the most recently finished ones, oldest first. The
    /// job store holds the full history.
    pub fn jobs(&self) -> Vec<FetchJob> {
        lock(&self.queue).all()
    }

    pub fn summary(&self) -> JobSummary {
        lock(&self.queue).summary()
    }

    pub async fn history(&self, id: JobId) -> Result<Vec<JobTransition>, SchedulerError> {
        let history = self.job_store.history(id).await?;
        if history.is_empty() && self.job(id).is_none() {
            return Err(SchedulerError::UnknownJob(id));
        }
        Ok(history)
    }

    /// Reloads jobs and deactivations from the job store. RUNNING jobs left
    /// by an interrupted process are moved to RETRY_SCHEDULED. Returns the
    /// number of active jobs resumed.
    pub async fn resume(&self) -> Result<usize, SchedulerError> {
        let deactivations = self.job_store.deactivations().await?;
        {
            let mut deactivated = lock(&self.deactivated);
            for entry in deactivations {
                deactivated.insert((entry.instrument, entry.source));
            }
        }

        let now = UtcDateTime::now();
        let mut resumed = 0;
        for mut job in self.job_store.load_all().await? {
            match job.state {
                JobState::Running => {
                    let from = job.transition(JobState::RetryScheduled)?;
                    job.last_error = Some(String::from("interrupted before completion"));
                    job.next_attempt_at = Some(now);
                    self.job_store.record_transition(&job, Some(from)).await?;
                    let id = job.id;
                    let mut queue = lock(&self.queue);
                    queue.upsert(job);
                    queue.schedule_retry(id, Instant::now());
                    resumed += 1;
                }
                JobState::RetryScheduled => {
                    let remaining = job
                        .next_attempt_at
                        .map(|at| at.since(now))
                        .and_then(|left| Duration::try_from(left).ok())
                        .unwrap_or(Duration::ZERO);
                    let id = job.id;
                    let mut queue = lock(&self.queue);
                    queue.upsert(job);
                    queue.schedule_retry(id, Instant::now() + remaining);
                    resumed += 1;
                }
                JobState::Pending => {
                    lock(&self.queue).upsert(job);
                    resumed += 1;
                }
                JobState::Succeeded | JobState::Failed => lock(&self.queue).upsert(job),
            }
        }

        tracing::info!(resumed, "scheduler resumed");
        if resumed > 0 {
            self.wake.notify_one();
        }
        Ok(resumed)
    }

    /// One dispatch round followed by a drain of the dispatched jobs.
    pub async fn run_once(self: &Arc<Self>) -> RunReport {
        let mut report = RunReport::default();
        let mut running = JoinSet::new();

        self.promote_due_retries().await;
        self.dispatch(&mut running, &mut report).await;
        while let Some(joined) = running.join_next().await {
            self.settle_joined(joined, &mut report).await;
        }
        self.recover_orphans().await;
        report
    }

    /// Dispatches until no job is pending, running or waiting for a retry.
    pub async fn run_until_idle(self: &Arc<Self>) -> RunReport {
        let mut report = RunReport::default();
        let mut running = JoinSet::new();

        loop {
            self.promote_due_retries().await;
            self.dispatch(&mut running, &mut report).await;
            if running.is_empty() {
                self.recover_orphans().await;
                if !lock(&self.queue).has_active() {
                    break;
                }
            }

            let wake_at = self.next_wake();
            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.settle_joined(joined, &mut report).await;
                }
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wake.notified() => {}
            }
        }

        report
    }

    /// Dispatches and enqueues periodic refresh jobs until `shutdown` turns
    /// true, then stops dispatching and drains in-flight jobs.
    pub async fn run_forever(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> RunReport {
        let mut report = RunReport::default();
        let mut running = JoinSet::new();
        let mut refresh = tokio::time::interval(self.config.refresh_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.promote_due_retries().await;
            self.dispatch(&mut running, &mut report).await;
            if running.is_empty() {
                self.recover_orphans().await;
            }

            let wake_at = self.next_wake();
            tokio::select! {
                _ = refresh.tick() => {
                    self.enqueue_refresh().await;
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.settle_joined(joined, &mut report).await;
                }
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(in_flight = running.len(), "shutdown requested, draining jobs");
        while let Some(joined) = running.join_next().await {
            self.settle_joined(joined, &mut report).await;
        }
        self.recover_orphans().await;
        report
    }

    /// Enqueues refresh jobs from each target's watermark (or lookback) up
    /// to the current step boundary.
    pub async fn enqueue_refresh(&self) -> usize {
        let mut enqueued = 0;
        for target in &self.refresh {
            let Some(step) = target.granularity.step() else {
                continue;
            };
            let series = SeriesKey::new(target.instrument.clone(), target.granularity);
            let end = UtcDateTime::now().floor_to(step);
            let start = match self.manager.ledger().watermark(&series) {
                Some(watermark) => watermark.last_confirmed.saturating_add(step),
                None => end.saturating_sub(target.lookback).floor_to(step),
            };
            let Ok(window) = TimeWindow::new(start, end) else {
                continue;
            };

            match self
                .enqueue(
                    target.instrument.clone(),
                    window,
                    target.granularity,
                    PriorityClass::Refresh,
                )
                .await
            {
                Ok(_) => enqueued += 1,
                Err(error) => tracing::warn!(
                    series = %series,
                    code = error.code(),
                    error = %error,
                    "refresh job not enqueued"
                ),
            }
        }
        enqueued
    }

    /// Re-prioritizes jobs after a write changed the gap ledger. New gaps not
    /// covered by an active job get a job of `class`; an active job already
    /// covering a gap is promoted to `class`. Pending gap-close jobs whose
    /// window no longer overlaps an open gap fall back to backfill.
    ///
    /// `reporter` is the job whose write produced `report`, if any.
    pub async fn handle_write_report(
        &self,
        report: &WriteReport,
        reporter: Option<JobId>,
        class: PriorityClass,
    ) -> usize {
        let mut created = 0;
        for gap in &report.new_gaps {
            let Some(window) = gap.window() else {
                continue;
            };
            if self.promote_covering(&report.series, &window, reporter, class) {
                continue;
            }

            match self
                .enqueue(report.series.instrument.clone(), window, report.series.granularity, class)
                .await
            {
                Ok(_) => created += 1,
                Err(error) => tracing::warn!(
                    series = %report.series,
                    gap = %window,
                    code = error.code(),
                    error = %error,
                    "gap job not enqueued"
                ),
            }
        }

        if !report.resolved_gaps.is_empty() {
            self.demote_resolved(&report.series);
        }
        created
    }

    fn promote_covering(
        &self,
        series: &SeriesKey,
        window: &TimeWindow,
        reporter: Option<JobId>,
        class: PriorityClass,
    ) -> bool {
        let mut queue = lock(&self.queue);
        let covering = queue
            .active_overlapping(series, window)
            .into_iter()
            .find(|job| Some(job.id) != reporter && job.window.covers(window));
        let Some(mut job) = covering else {
            return false;
        };
        if job.priority.class < class {
            tracing::debug!(job_id = %job.id, class = class.as_str(), "job promoted for gap");
            job.priority = job.priority.with_class(class);
            queue.upsert(job);
        }
        true
    }

    fn demote_resolved(&self, series: &SeriesKey) {
        let open: Vec<TimeWindow> = self
            .manager
            .ledger()
            .open_gaps(series)
            .iter()
            .filter_map(|gap| gap.window())
            .collect();

        let mut queue = lock(&self.queue);
        let stale: Vec<FetchJob> = queue
            .pending()
            .into_iter()
            .filter(|job| {
                job.priority.class == PriorityClass::GapClose
                    && job.instrument == series.instrument
                    && job.granularity == series.granularity
                    && !open.iter().any(|gap| gap.overlaps(&job.window))
            })
            .collect();
        for mut job in stale {
            tracing::debug!(job_id = %job.id, "gap resolved, job demoted to backfill");
            job.priority = job.priority.with_class(PriorityClass::Backfill);
            queue.upsert(job);
        }
    }

    fn next_wake(&self) -> Instant {
        let idle = Instant::now() + self.config.idle_poll;
        match lock(&self.queue).next_retry() {
            Some(retry) => retry.min(idle),
            None => idle,
        }
    }

    async fn promote_due_retries(&self) {
        let due = lock(&self.queue).due_retries(Instant::now());
        for id in due {
            let Some(mut job) = self.job(id) else {
                continue;
            };
            let Ok(from) = job.transition(JobState::Pending) else {
                continue;
            };
            job.next_attempt_at = None;
            self.persist(&job, from).await;
            lock(&self.queue).upsert(job);
        }
    }

    /// Starts every pending job whose instrument gate, source worker slot
    /// and circuit admit it. Never waits on a source.
    async fn dispatch(self: &Arc<Self>, running: &mut JoinSet<Attempt>, report: &mut RunReport) {
        let pending = lock(&self.queue).pending();
        for mut job in pending {
            let Some(adapter) = self.registry.get(&job.source) else {
                self.fail_undispatchable(job, "source is not registered", report)
                    .await;
                continue;
            };
            if self.is_deactivated(&job.instrument, &job.source) {
                self.fail_undispatchable(job, "source is deactivated for instrument", report)
                    .await;
                continue;
            }
            let Some(slot) = self.slots.get(&job.source) else {
                continue;
            };

            let Some(gate) = self.gates.try_enter(&job.instrument) else {
                continue;
            };
            let Ok(permit) = Arc::clone(&slot.workers).try_acquire_owned() else {
                continue;
            };
            if !slot.breaker.allow_request() {
                tracing::debug!(job_id = %job.id, source = %job.source, "circuit open, job held");
                continue;
            }

            let Ok(from) = job.transition(JobState::Running) else {
                continue;
            };
            job.attempt_count = job.attempt_count.saturating_add(1);
            self.persist(&job, from).await;
            lock(&self.queue).upsert(job.clone());
            report.dispatched += 1;

            tracing::info!(
                job_id = %job.id,
                instrument = %job.instrument,
                source = %job.source,
                window = %job.window,
                attempt = job.attempt_count,
                priority = %job.priority,
                "job dispatched"
            );
            let span = tracing::info_span!("job", job_id = %job.id, source = %job.source);
            let scheduler = Arc::clone(self);
            running.spawn(
                async move {
                    let result = scheduler.attempt(&job, adapter, gate, permit).await;
                    (job, result)
                }
                .instrument(span),
            );
        }
    }

    /// Fetch, validate and write one job. The gate and worker permit are
    /// held until the write has completed.
    async fn attempt(
        &self,
        job: &FetchJob,
        adapter: Arc<dyn SourceAdapter>,
        _gate: OwnedMutexGuard<()>,
        _permit: OwnedSemaphorePermit,
    ) -> AttemptResult {
        let fetched = tokio::time::timeout(
            self.config.job_timeout,
            adapter.fetch_historical(&job.instrument, job.window, job.granularity),
        )
        .await;
        let (records, expected) = match fetched {
            Err(_) => return AttemptResult::TimedOut,
            Ok(Ok(records)) => (records, None),
            Ok(Err(FetchError::Partial { records, expected })) => (records, Some(expected)),
            Ok(Err(error)) => return AttemptResult::Fetch(error),
        };

        let request = BatchRequest {
            instrument: job.instrument.clone(),
            source: job.source.clone(),
            window: job.window,
            granularity: job.granularity,
            kind: job.data_kind,
        };
        let context = match self
            .manager
            .quality_context(&request, self.engine.config().lookback)
            .await
        {
            Ok(context) => context,
            Err(error) => return AttemptResult::Storage(error),
        };
        let batch = self.engine.validate(&request, records, expected, &context);

        match self.manager.write(batch).await {
            Ok(report) => AttemptResult::Written {
                report,
                partial: expected.is_some(),
            },
            Err(ManagerError::QualityRejected { batch_id, codes }) => {
                AttemptResult::Rejected { batch_id, codes }
            }
            Err(ManagerError::Storage(error)) => AttemptResult::Storage(error),
        }
    }

    async fn settle_joined(&self, joined: Result<Attempt, JoinError>, report: &mut RunReport) {
        match joined {
            Ok((job, result)) => self.settle(job, result, report).await,
            Err(error) => tracing::error!(error = %error, "job worker aborted"),
        }
    }

    /// Applies the attempt outcome: final state, retry schedule, breaker
    /// bookkeeping and gap feedback.
    async fn settle(&self, job: FetchJob, result: AttemptResult, report: &mut RunReport) {
        let breaker = self.slots.get(&job.source).map(|slot| &slot.breaker);
        let record = |outcome: fn(&CircuitBreaker)| {
            if let Some(breaker) = breaker {
                outcome(breaker);
            }
        };

        match result {
            AttemptResult::Written {
                report: write,
                partial,
            } => {
                record(CircuitBreaker::record_success);
                report.gap_jobs += self
                    .handle_write_report(&write, Some(job.id), PriorityClass::GapClose)
                    .await;
                if partial {
                    let message = format!("source.partial: {} rows written, re-fetching window", write.written);
                    self.retry_or_fail(job, message, None, true, report).await;
                } else {
                    self.succeed(job, report).await;
                }
            }
            AttemptResult::Rejected { batch_id, codes } => {
                record(CircuitBreaker::record_neutral);
                let message = format!("quality.rejected: batch {batch_id} ({codes})");
                self.retry_or_fail(job, message, None, true, report).await;
            }
            AttemptResult::TimedOut => {
                record(CircuitBreaker::record_failure);
                let message = format!("source.timeout: fetch exceeded {:?}", self.config.job_timeout);
                self.retry_or_fail(job, message, None, false, report).await;
            }
            AttemptResult::Storage(error) => {
                record(CircuitBreaker::record_neutral);
                let message = format!("{}: {error}", error.code());
                self.retry_or_fail(job, message, None, false, report).await;
            }
            AttemptResult::Fetch(error) => {
                let message = format!("{}: {error}", error.code());
                match error {
                    FetchError::Transient { .. } => {
                        record(CircuitBreaker::record_failure);
                        self.retry_or_fail(job, message, None, false, report).await;
                    }
                    FetchError::RateLimited { retry_after, .. } => {
                        record(CircuitBreaker::record_neutral);
                        self.retry_or_fail(job, message, retry_after, false, report)
                            .await;
                    }
                    FetchError::Partial { .. } => {
                        record(CircuitBreaker::record_neutral);
                        self.retry_or_fail(job, message, None, true, report).await;
                    }
                    FetchError::Permanent { .. } => {
                        record(CircuitBreaker::record_neutral);
                        self.deactivate(&job, &message).await;
                        self.fail(job, message, report).await;
                    }
                    FetchError::Malformed { .. } => {
                        record(CircuitBreaker::record_neutral);
                        self.fail(job, message, report).await;
                    }
                }
            }
        }
    }

    async fn succeed(&self, mut job: FetchJob, report: &mut RunReport) {
        let Ok(from) = job.transition(JobState::Succeeded) else {
            return;
        };
        job.last_error = None;
        tracing::info!(job_id = %job.id, attempt = job.attempt_count, "job succeeded");
        self.persist(&job, from).await;
        lock(&self.queue).upsert(job);
        report.succeeded += 1;
    }

    async fn retry_or_fail(
        &self,
        mut job: FetchJob,
        message: String,
        retry_after: Option<Duration>,
        demote: bool,
        report: &mut RunReport,
    ) {
        if self.retry.exhausted(job.attempt_count) {
            let message = format!("{message} (after {} attempts)", job.attempt_count);
            self.fail(job, message, report).await;
            return;
        }

        let Ok(from) = job.transition(JobState::RetryScheduled) else {
            return;
        };
        let delay = self.retry.delay(job.attempt_count, retry_after);
        if demote {
            job.priority = job.priority.demoted();
        }
        job.next_attempt_at = Some(
            UtcDateTime::now()
                .saturating_add(time::Duration::try_from(delay).unwrap_or(time::Duration::MAX)),
        );
        tracing::warn!(
            job_id = %job.id,
            attempt = job.attempt_count,
            delay_ms = delay.as_millis() as u64,
            priority = %job.priority,
            error = %message,
            "job retry scheduled"
        );
        job.last_error = Some(message);
        self.persist(&job, from).await;

        let id = job.id;
        let mut queue = lock(&self.queue);
        queue.upsert(job);
        queue.schedule_retry(id, Instant::now() + delay);
        report.retried += 1;
    }

    async fn fail(&self, mut job: FetchJob, message: String, report: &mut RunReport) {
        let Ok(from) = job.transition(JobState::Failed) else {
            return;
        };
        tracing::error!(
            job_id = %job.id,
            instrument = %job.instrument,
            source = %job.source,
            window = %job.window,
            attempt = job.attempt_count,
            error = %message,
            "job failed"
        );
        job.last_error = Some(message);
        self.persist(&job, from).await;
        lock(&self.queue).upsert(job);
        report.failed += 1;
    }

    /// Fails a pending job that can no longer be dispatched without fetching.
    async fn fail_undispatchable(&self, mut job: FetchJob, reason: &str, report: &mut RunReport) {
        let Ok(from) = job.transition(JobState::Running) else {
            return;
        };
        self.persist(&job, from).await;
        self.fail(job, format!("scheduler.undispatchable: {reason}"), report)
            .await;
    }

    async fn deactivate(&self, job: &FetchJob, reason: &str) {
        lock(&self.deactivated).insert((job.instrument.clone(), job.source.clone()));
        tracing::warn!(
            instrument = %job.instrument,
            source = %job.source,
            reason,
            "source deactivated for instrument"
        );
        if let Err(error) = self
            .job_store
            .deactivate(&job.instrument, &job.source, reason)
            .await
        {
            tracing::error!(code = error.code(), error = %error, "deactivation not persisted");
        }
    }

    /// Jobs still RUNNING once no worker is in flight lost their worker.
    async fn recover_orphans(&self) {
        let orphans = lock(&self.queue).running();
        for job in orphans {
            let mut report = RunReport::default();
            self.retry_or_fail(job, String::from("worker aborted"), None, false, &mut report)
                .await;
        }
    }

    /// Records a transition. The in-memory state stays authoritative when
    /// the job store is unavailable.
    async fn persist(&self, job: &FetchJob, from: JobState) {
        if let Err(error) = self.job_store.record_transition(job, Some(from)).await {
            tracing::error!(
                job_id = %job.id,
                from = from.as_str(),
                to = job.state.as_str(),
                code = error.code(),
                error = %error,
                "job transition not persisted"
            );
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
