use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use crate::ledger::SeriesKey;
use crate::scheduler::{FetchJob, JobId, JobKey, JobState, JobSummary};
use crate::TimeWindow;

/// Finished jobs kept in memory for `job(id)` lookups. Older ones are only
/// in the job store.
pub(crate) const FINISHED_CAPACITY: usize = 1024;

/// In-memory job table. Active jobs live in `jobs`; finished jobs move to a
/// bounded tail and are only counted once they fall off it.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    jobs: HashMap<JobId, FetchJob>,
    active: HashMap<JobKey, JobId>,
    retry_at: HashMap<JobId, Instant>,
    finished: HashMap<JobId, FetchJob>,
    finished_order: VecDeque<JobId>,
    succeeded: usize,
    failed: usize,
}

impl JobQueue {
    pub fn find_active(&self, key: &JobKey) -> Option<JobId> {
        self.active.get(key).copied()
    }

    /// Claims `key` for `id` before the job is persisted. Returns the id
    /// already holding the key, if any.
    pub fn reserve(&mut self, key: JobKey, id: JobId) -> Result<(), JobId> {
        if let Some(existing) = self.active.get(&key) {
            return Err(*existing);
        }
        self.active.insert(key, id);
        Ok(())
    }

    /// Drops a reservation that never became a job.
    pub fn release(&mut self, key: &JobKey, id: JobId) {
        if self.active.get(key) == Some(&id) && !self.jobs.contains_key(&id) {
            self.active.remove(key);
        }
    }

    /// Stores `job`, keeping the active index in step with its state.
    pub fn upsert(&mut self, job: FetchJob) {
        let key = job.key();
        if job.state != JobState::RetryScheduled {
            self.retry_at.remove(&job.id);
        }
        if job.state.is_active() {
            self.active.insert(key, job.id);
            self.jobs.insert(job.id, job);
            return;
        }

        if self.active.get(&key) == Some(&job.id) {
            self.active.remove(&key);
        }
        self.jobs.remove(&job.id);
        self.finish(job);
    }

    fn finish(&mut self, job: FetchJob) {
        if !self.finished.contains_key(&job.id) {
            match job.state {
                JobState::Succeeded => self.succeeded += 1,
                JobState::Failed => self.failed += 1,
                _ => {}
            }
            self.finished_order.push_back(job.id);
        }
        self.finished.insert(job.id, job);
        while self.finished_order.len() > FINISHED_CAPACITY {
            if let Some(evicted) = self.finished_order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }

    pub fn get(&self, id: JobId) -> Option<&FetchJob> {
        self.jobs.get(&id).or_else(|| self.finished.get(&id))
    }

    pub fn schedule_retry(&mut self, id: JobId, at: Instant) {
        self.retry_at.insert(id, at);
    }

    /// Retry-scheduled jobs whose backoff has elapsed.
    pub fn due_retries(&self, now: Instant) -> Vec<JobId> {
        let mut due: Vec<(Instant, JobId)> = self
            .retry_at
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*at, *id))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    /// Pending jobs in dispatch order: priority, then age, then id.
    pub fn pending(&self) -> Vec<FetchJob> {
        let mut pending: Vec<FetchJob> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then_with(|| left.created_at.cmp(&right.created_at))
                .then_with(|| left.id.cmp(&right.id))
        });
        pending
    }

    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Active jobs for `series` whose window overlaps `window`.
    pub fn active_overlapping(&self, series: &SeriesKey, window: &TimeWindow) -> Vec<FetchJob> {
        self.active
            .values()
            .filter_map(|id| self.jobs.get(id))
            .filter(|job| {
                job.instrument == series.instrument
                    && job.granularity == series.granularity
                    && job.window.overlaps(window)
            })
            .cloned()
            .collect()
    }

    pub fn running(&self) -> Vec<FetchJob> {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .cloned()
            .collect()
    }

    /// Active jobs plus the retained finished tail, oldest first.
    pub fn all(&self) -> Vec<FetchJob> {
        let mut jobs: Vec<FetchJob> = self
            .jobs
            .values()
            .chain(self.finished.values())
            .cloned()
            .collect();
        jobs.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        jobs
    }

    /// Counts of active jobs and of every job finished by this process.
    pub fn summary(&self) -> JobSummary {
        let mut summary = JobSummary::from_jobs(self.jobs.values());
        summary.add(JobState::Succeeded, self.succeeded);
        summary.add(JobState::Failed, self.failed);
        summary
    }
}
