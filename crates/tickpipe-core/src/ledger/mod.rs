//! Per-series coverage, gap and watermark bookkeeping.

mod interval_set;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::{Granularity, InstrumentId, TimeWindow, UtcDateTime};

pub use interval_set::IntervalSet;

/// One stored time series: an instrument sampled at one granularity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub instrument: InstrumentId,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(instrument: InstrumentId, granularity: Granularity) -> Self {
        Self {
            instrument,
            granularity,
        }
    }

    /// Width used to turn coverage ends into a last confirmed timestamp.
    pub fn step(&self) -> Duration {
        self.granularity
            .step()
            .unwrap_or(Duration::nanoseconds(1))
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instrument, self.granularity)
    }
}

/// Missing range detected by the quality engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapInterval {
    pub instrument: InstrumentId,
    pub granularity: Granularity,
    pub start: UtcDateTime,
    pub end: UtcDateTime,
    pub discovered_at: UtcDateTime,
    pub resolved_at: Option<UtcDateTime>,
}

impl GapInterval {
    pub fn window(&self) -> Option<TimeWindow> {
        TimeWindow::new(self.start, self.end).ok()
    }

    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_confirmed: UtcDateTime,
    pub last_updated_at: UtcDateTime,
}

/// Gap changes implied by one batch against the current ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapDiff {
    pub new_gaps: Vec<TimeWindow>,
    pub resolved: Vec<TimeWindow>,
}

/// Missing slots outside confirmed coverage and outside already-open gaps
/// become new gaps; open gaps fully inside `present` are resolved.
pub fn diff_gaps(
    coverage: &IntervalSet,
    open_gaps: &[TimeWindow],
    missing: &IntervalSet,
    present: &IntervalSet,
) -> GapDiff {
    let open = IntervalSet::from_windows(open_gaps.iter().copied());
    let new_gaps = missing.subtract(coverage).subtract(&open).windows();
    let resolved = open_gaps
        .iter()
        .filter(|gap| present.contains(gap))
        .copied()
        .collect();

    GapDiff { new_gaps, resolved }
}

/// Outcome of applying a batch to the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedDelta {
    pub new_gaps: Vec<GapInterval>,
    pub resolved_gaps: Vec<GapInterval>,
    /// Set only when the watermark moved forward.
    pub watermark: Option<Watermark>,
}

impl AppliedDelta {
    pub fn changed_gaps(&self) -> bool {
        !self.new_gaps.is_empty() || !self.resolved_gaps.is_empty()
    }
}

#[derive(Debug, Default)]
struct SeriesLedger {
    coverage: IntervalSet,
    open_gaps: BTreeMap<UtcDateTime, GapInterval>,
    resolved_gaps: Vec<GapInterval>,
    watermark: Option<Watermark>,
}

impl SeriesLedger {
    fn open_windows(&self) -> Vec<TimeWindow> {
        self.open_gaps.values().filter_map(GapInterval::window).collect()
    }

    fn apply(
        &mut self,
        key: &SeriesKey,
        present: &IntervalSet,
        missing: &IntervalSet,
        now: UtcDateTime,
    ) -> AppliedDelta {
        let diff = diff_gaps(&self.coverage, &self.open_windows(), missing, present);
        let mut applied = AppliedDelta::default();

        for window in diff.resolved {
            if let Some(mut gap) = self.open_gaps.remove(&window.start()) {
                gap.resolved_at = Some(now);
                self.resolved_gaps.push(gap.clone());
                applied.resolved_gaps.push(gap);
            }
        }

        for window in present.windows() {
            self.coverage.insert(window);
        }

        for window in diff.new_gaps {
            let gap = GapInterval {
                instrument: key.instrument.clone(),
                granularity: key.granularity,
                start: window.start(),
                end: window.end(),
                discovered_at: now,
                resolved_at: None,
            };
            self.open_gaps.insert(gap.start, gap.clone());
            applied.new_gaps.push(gap);
        }

        applied.watermark = self.advance_watermark(key.step(), now);
        applied
    }

    /// Moves the watermark to the end of the contiguous confirmed run that
    /// holds it, stopping at the first unresolved gap. Never moves backwards.
    fn advance_watermark(&mut self, step: Duration, now: UtcDateTime) -> Option<Watermark> {
        let anchor = match self.watermark {
            Some(watermark) => self.coverage.run_containing(watermark.last_confirmed)?,
            None => self.coverage.first()?,
        };

        let mut end = anchor.end();
        if let Some((gap_start, _)) = self.open_gaps.range(anchor.start()..end).next() {
            end = *gap_start;
        }
        if end <= anchor.start() {
            return None;
        }

        let candidate = end.saturating_sub(step).max(anchor.start());
        let advanced = self
            .watermark
            .map_or(true, |current| candidate > current.last_confirmed);
        if !advanced {
            return None;
        }

        let watermark = Watermark {
            last_confirmed: candidate,
            last_updated_at: now,
        };
        self.watermark = Some(watermark);
        Some(watermark)
    }
}

/// Persistable state of one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub key: SeriesKey,
    pub coverage: Vec<TimeWindow>,
    /// Open and resolved gaps.
    pub gaps: Vec<GapInterval>,
    pub watermark: Option<Watermark>,
}

/// Read-only copy of a series used while validating a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerView {
    pub coverage: IntervalSet,
    pub open_gaps: Vec<TimeWindow>,
    pub watermark: Option<Watermark>,
}

/// Shared ledger. Each series is locked independently.
#[derive(Debug, Default)]
pub struct Ledger {
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<SeriesLedger>>>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self, key: &SeriesKey) -> LedgerView {
        let Some(series) = self.existing(key) else {
            return LedgerView::default();
        };
        let series = lock(&series);
        LedgerView {
            coverage: series.coverage.clone(),
            open_gaps: series.open_windows(),
            watermark: series.watermark,
        }
    }

    pub fn apply(
        &self,
        key: &SeriesKey,
        present: &IntervalSet,
        missing: &IntervalSet,
        now: UtcDateTime,
    ) -> AppliedDelta {
        let series = self.entry(key);
        let mut series = lock(&series);
        series.apply(key, present, missing, now)
    }

    pub fn watermark(&self, key: &SeriesKey) -> Option<Watermark> {
        self.existing(key).and_then(|series| lock(&series).watermark)
    }

    pub fn open_gaps(&self, key: &SeriesKey) -> Vec<GapInterval> {
        self.existing(key)
            .map(|series| lock(&series).open_gaps.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn resolved_gaps(&self, key: &SeriesKey) -> Vec<GapInterval> {
        self.existing(key)
            .map(|series| lock(&series).resolved_gaps.clone())
            .unwrap_or_default()
    }

    /// Open gaps across all series, ordered by series then start.
    pub fn all_open_gaps(&self) -> Vec<GapInterval> {
        let mut keys = self.keys();
        keys.sort();
        keys.iter().flat_map(|key| self.open_gaps(key)).collect()
    }

    pub fn keys(&self) -> Vec<SeriesKey> {
        self.series
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn snapshot(&self, key: &SeriesKey) -> LedgerSnapshot {
        let mut snapshot = LedgerSnapshot {
            key: key.clone(),
            coverage: Vec::new(),
            gaps: Vec::new(),
            watermark: None,
        };
        if let Some(series) = self.existing(key) {
            let series = lock(&series);
            snapshot.coverage = series.coverage.windows();
            snapshot.gaps = series
                .open_gaps
                .values()
                .chain(series.resolved_gaps.iter())
                .cloned()
                .collect();
            snapshot.watermark = series.watermark;
        }
        snapshot
    }

    /// Replaces in-memory state with persisted snapshots.
    pub fn restore(&self, snapshots: Vec<LedgerSnapshot>) {
        let mut map = self
            .series
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for snapshot in snapshots {
            let mut series = SeriesLedger {
                coverage: IntervalSet::from_windows(snapshot.coverage),
                watermark: snapshot.watermark,
                ..SeriesLedger::default()
            };
            for gap in snapshot.gaps {
                if gap.is_open() {
                    series.open_gaps.insert(gap.start, gap);
                } else {
                    series.resolved_gaps.push(gap);
                }
            }
            map.insert(snapshot.key, Arc::new(Mutex::new(series)));
        }
    }

    fn existing(&self, key: &SeriesKey) -> Option<Arc<Mutex<SeriesLedger>>> {
        self.series
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn entry(&self, key: &SeriesKey) -> Arc<Mutex<SeriesLedger>> {
        if let Some(series) = self.existing(key) {
            return series;
        }
        let mut map = self
            .series
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(key.clone()).or_default())
    }
}

fn lock(series: &Mutex<SeriesLedger>) -> MutexGuard<'_, SeriesLedger> {
    series.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
