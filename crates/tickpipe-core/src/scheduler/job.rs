use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::SeriesKey;
use crate::{DataKind, Granularity, InstrumentId, SourceId, TimeWindow, UtcDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    RetryScheduled,
    Failed,
}

impl JobState {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Running,
        Self::Succeeded,
        Self::RetryScheduled,
        Self::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::RetryScheduled => "RETRY_SCHEDULED",
            Self::Failed => "FAILED",
        }
    }

    /// Jobs that still hold their (instrument, source, window, kind) slot.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::RetryScheduled)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::RetryScheduled)
                | (Self::Running, Self::Failed)
                | (Self::RetryScheduled, Self::Pending)
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("unknown job state '{value}'"))
    }
}

/// Priority classes, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Backfill,
    Refresh,
    GapClose,
    Realtime,
}

impl PriorityClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Refresh => "refresh",
            Self::GapClose => "gap_close",
            Self::Realtime => "realtime",
        }
    }
}

impl FromStr for PriorityClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "backfill" => Ok(Self::Backfill),
            "refresh" => Ok(Self::Refresh),
            "gap_close" | "gap-close" => Ok(Self::GapClose),
            "realtime" => Ok(Self::Realtime),
            other => Err(format!("unknown priority class '{other}'")),
        }
    }
}

/// Dispatch priority. Greater values are dispatched first: higher class,
/// then fewer demotions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub class: PriorityClass,
    pub demotions: u32,
}

impl Priority {
    pub const fn new(class: PriorityClass) -> Self {
        Self {
            class,
            demotions: 0,
        }
    }

    pub const fn demoted(self) -> Self {
        Self {
            class: self.class,
            demotions: self.demotions.saturating_add(1),
        }
    }

    pub const fn with_class(self, class: PriorityClass) -> Self {
        Self {
            class,
            demotions: self.demotions,
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.class
            .cmp(&other.class)
            .then_with(|| other.demotions.cmp(&self.demotions))
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.class.as_str(), self.demotions)
    }
}

/// Unit of scheduled fetch work. Owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchJob {
    pub id: JobId,
    pub instrument: InstrumentId,
    pub source: SourceId,
    pub data_kind: DataKind,
    pub window: TimeWindow,
    pub granularity: Granularity,
    pub priority: Priority,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: UtcDateTime,
    pub updated_at: UtcDateTime,
    pub next_attempt_at: Option<UtcDateTime>,
}

/// Identity used to deduplicate active jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub instrument: InstrumentId,
    pub source: SourceId,
    pub window: TimeWindow,
    pub granularity: Granularity,
    pub data_kind: DataKind,
}

impl FetchJob {
    pub fn new(
        instrument: InstrumentId,
        source: SourceId,
        window: TimeWindow,
        granularity: Granularity,
        priority: Priority,
    ) -> Self {
        let now = UtcDateTime::now();
        Self {
            id: JobId::new(),
            instrument,
            source,
            data_kind: DataKind::Historical,
            window,
            granularity,
            priority,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_attempt_at: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            instrument: self.instrument.clone(),
            source: self.source.clone(),
            window: self.window,
            granularity: self.granularity,
            data_kind: self.data_kind,
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.instrument.clone(), self.granularity)
    }

    /// Moves the job along the state machine and returns the previous state.
    pub fn transition(&mut self, next: JobState) -> Result<JobState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition {
                job: self.id,
                from,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = UtcDateTime::now();
        Ok(from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job {job} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}
