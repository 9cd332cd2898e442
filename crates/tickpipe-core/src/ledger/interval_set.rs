use std::collections::BTreeMap;

use crate::{TimeWindow, UtcDateTime};

/// Disjoint, non-adjacent half-open intervals keyed by start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    runs: BTreeMap<UtcDateTime, UtcDateTime>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_windows<I>(windows: I) -> Self
    where
        I: IntoIterator<Item = TimeWindow>,
    {
        let mut set = Self::new();
        for window in windows {
            set.insert(window);
        }
        set
    }

    /// Adds `window`, merging with overlapping or touching runs.
    pub fn insert(&mut self, window: TimeWindow) {
        let mut start = window.start();
        let mut end = window.end();

        // Runs are disjoint and sorted, so their ends ascend with their starts.
        let touching: Vec<UtcDateTime> = self
            .runs
            .range(..=end)
            .rev()
            .take_while(|(_, run_end)| **run_end >= start)
            .map(|(run_start, _)| *run_start)
            .collect();

        for run_start in touching {
            if let Some(run_end) = self.runs.remove(&run_start) {
                start = start.min(run_start);
                end = end.max(run_end);
            }
        }
        self.runs.insert(start, end);
    }

    /// Parts of `self` not covered by `other`.
    pub fn subtract(&self, other: &Self) -> Self {
        let mut result = Self::new();
        for (&start, &end) in &self.runs {
            let mut cursor = start;
            let first_cut = other
                .runs
                .range(..=start)
                .next_back()
                .map_or(start, |(cut_start, _)| *cut_start);
            for (&cut_start, &cut_end) in other.runs.range(first_cut..end) {
                if cut_end <= cursor {
                    continue;
                }
                if cut_start > cursor {
                    result.push_raw(cursor, cut_start.min(end));
                }
                cursor = cursor.max(cut_end);
                if cursor >= end {
                    break;
                }
            }
            if cursor < end {
                result.push_raw(cursor, end);
            }
        }
        result
    }

    /// True when `window` lies entirely inside one run.
    pub fn contains(&self, window: &TimeWindow) -> bool {
        self.run_containing(window.start())
            .is_some_and(|run| run.end() >= window.end())
    }

    pub fn overlaps(&self, window: &TimeWindow) -> bool {
        self.runs
            .range(..window.end())
            .next_back()
            .is_some_and(|(_, end)| *end > window.start())
    }

    pub fn run_containing(&self, ts: UtcDateTime) -> Option<TimeWindow> {
        let (&start, &end) = self.runs.range(..=ts).next_back()?;
        if end > ts {
            TimeWindow::new(start, end).ok()
        } else {
            None
        }
    }

    pub fn first(&self) -> Option<TimeWindow> {
        let (&start, &end) = self.runs.iter().next()?;
        TimeWindow::new(start, end).ok()
    }

    pub fn windows(&self) -> Vec<TimeWindow> {
        self.runs
            .iter()
            .filter_map(|(&start, &end)| TimeWindow::new(start, end).ok())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    fn push_raw(&mut self, start: UtcDateTime, end: UtcDateTime) {
        if start < end {
            self.runs.insert(start, end);
        }
    }
}
