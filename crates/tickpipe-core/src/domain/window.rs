use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, Weekday};

use crate::{UtcDateTime, ValidationError};

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: UtcDateTime,
    end: UtcDateTime,
}

impl TimeWindow {
    pub fn new(start: UtcDateTime, end: UtcDateTime) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptyWindow {
                start: start.format_rfc3339(),
                end: end.format_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Self::new(UtcDateTime::parse(start)?, UtcDateTime::parse(end)?)
    }

    pub const fn start(&self) -> UtcDateTime {
        self.start
    }

    pub const fn end(&self) -> UtcDateTime {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end.since(self.start)
    }

    pub fn contains(&self, ts: UtcDateTime) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn covers(&self, other: &Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Expected bar open times inside the window for `step`, filtered by `calendar`.
    pub fn expected_slots(&self, step: Duration, calendar: SessionCalendar) -> Vec<UtcDateTime> {
        let mut slots = Vec::new();
        if step <= Duration::ZERO {
            return slots;
        }

        let mut cursor = self.start.floor_to(step);
        if cursor < self.start {
            cursor = cursor.saturating_add(step);
        }
        while cursor < self.end {
            if calendar.is_session(cursor) {
                slots.push(cursor);
            }
            cursor = cursor.saturating_add(step);
        }
        slots
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Trading-session filter used when deriving expected bar slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCalendar {
    /// Every slot is expected (crypto, synthetic feeds).
    #[default]
    Continuous,
    /// Saturday and Sunday slots are not expected.
    Weekdays,
}

impl SessionCalendar {
    pub fn is_session(self, ts: UtcDateTime) -> bool {
        match self {
            Self::Continuous => true,
            Self::Weekdays => !matches!(ts.weekday(), Weekday::Saturday | Weekday::Sunday),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_window() {
        let err = TimeWindow::parse("2024-01-02T00:00:00Z", "2024-01-01T00:00:00Z")
            .expect_err("must fail");
        assert!(matches!(err, ValidationError::EmptyWindow { .. }));
    }

    #[test]
    fn daily_slots_follow_half_open_bounds() {
        let window =
            TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-31T00:00:00Z").expect("window");
        let slots = window.expected_slots(Duration::days(1), SessionCalendar::Continuous);
        assert_eq!(slots.len(), 30);
        assert_eq!(slots[0].format_rfc3339(), "2024-01-01T00:00:00Z");
        assert_eq!(slots[29].format_rfc3339(), "2024-01-30T00:00:00Z");
    }

    #[test]
    fn weekday_calendar_skips_weekends() {
        // 2024-01-06 is a Saturday.
        let window =
            TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-08T00:00:00Z").expect("window");
        let slots = window.expected_slots(Duration::days(1), SessionCalendar::Weekdays);
        assert_eq!(slots.len(), 5);
    }

    #[test]
    fn unaligned_start_rounds_up_to_next_slot() {
        let window =
            TimeWindow::parse("2024-01-01T00:30:00Z", "2024-01-01T03:00:00Z").expect("window");
        let slots = window.expected_slots(Duration::hours(1), SessionCalendar::Continuous);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].format_rfc3339(), "2024-01-01T01:00:00Z");
    }
}
