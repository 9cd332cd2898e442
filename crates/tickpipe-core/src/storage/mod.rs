//! Persistence seams: canonical records, audit trail, job history and ledger.

mod memory;
mod warehouse;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::{LedgerSnapshot, SeriesKey};
use crate::quality::{BatchRequest, QualityVerdict};
use crate::scheduler::{FetchJob, JobId, JobState};
use crate::{InstrumentId, Record, SourceId, TimeWindow, UtcDateTime};

pub use memory::MemoryStore;
pub use warehouse::WarehouseStore;

pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The conflict policy could not be applied atomically; nothing was written.
    #[error("storage conflict: {message}")]
    Conflict { message: String },
    #[error("storage backend error: {message}")]
    Backend { message: String },
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },
}

impl StorageError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "storage.conflict",
            Self::Backend { .. } => "storage.backend",
            Self::Unavailable { .. } => "storage.unavailable",
        }
    }
}

/// How an upsert treats an existing row with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Replace only when the payload differs. Re-running a fetch writes nothing.
    ReplaceIfChanged,
    AlwaysReplace,
    KeepExisting,
}

impl ConflictPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReplaceIfChanged => "replace_if_changed",
            Self::AlwaysReplace => "always_replace",
            Self::KeepExisting => "keep_existing",
        }
    }

    /// Whether `incoming` should overwrite `existing` under this policy.
    pub fn should_write(self, existing: Option<&Record>, incoming: &Record) -> bool {
        match (self, existing) {
            (_, None) => true,
            (Self::AlwaysReplace, Some(_)) => true,
            (Self::KeepExisting, Some(_)) => false,
            (Self::ReplaceIfChanged, Some(existing)) => !existing.same_payload(incoming),
        }
    }
}

/// Verdict retained for review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub request: BatchRequest,
    pub verdict: QualityVerdict,
    pub recorded_at: UtcDateTime,
}

/// One persisted state change of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTransition {
    pub job_id: JobId,
    pub from: Option<JobState>,
    pub to: JobState,
    pub attempt: u32,
    pub error: Option<String>,
    pub at: UtcDateTime,
}

/// (instrument, source) pair disabled after a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deactivation {
    pub instrument: InstrumentId,
    pub source: SourceId,
    pub reason: String,
    pub at: UtcDateTime,
}

/// Transactional store of canonical records keyed by
/// `(instrument, granularity, ts, source)`.
pub trait StorageGateway: Send + Sync {
    /// Writes `records` atomically and returns how many rows changed.
    fn upsert<'a>(&'a self, records: &'a [Record], policy: ConflictPolicy) -> StorageFuture<'a, usize>;

    /// Every source's records for the series inside `window`, ordered by
    /// timestamp then source.
    fn query_range<'a>(&'a self, key: &'a SeriesKey, window: TimeWindow) -> StorageFuture<'a, Vec<Record>>;

    fn record_verdict<'a>(
        &'a self,
        request: &'a BatchRequest,
        verdict: &'a QualityVerdict,
    ) -> StorageFuture<'a, ()>;

    fn audit_trail<'a>(&'a self, instrument: &'a InstrumentId) -> StorageFuture<'a, Vec<AuditEntry>>;
}

/// Durable job history.
pub trait JobStore: Send + Sync {
    /// Persists the job's current state and appends the transition from `from`.
    fn record_transition<'a>(
        &'a self,
        job: &'a FetchJob,
        from: Option<JobState>,
    ) -> StorageFuture<'a, ()>;

    /// Latest persisted state of every job.
    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<FetchJob>>;

    fn history<'a>(&'a self, job_id: JobId) -> StorageFuture<'a, Vec<JobTransition>>;

    fn deactivate<'a>(
        &'a self,
        instrument: &'a InstrumentId,
        source: &'a SourceId,
        reason: &'a str,
    ) -> StorageFuture<'a, ()>;

    fn deactivations<'a>(&'a self) -> StorageFuture<'a, Vec<Deactivation>>;
}

/// Durable gap ledger and watermarks.
pub trait LedgerStore: Send + Sync {
    fn save<'a>(&'a self, snapshot: &'a LedgerSnapshot) -> StorageFuture<'a, ()>;

    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<LedgerSnapshot>>;
}
