use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::ValidationError;

/// Sampling granularity for a fetch: raw ticks or fixed-width bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Granularity {
    #[serde(rename = "tick")]
    Tick,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
}

impl Granularity {
    pub const ALL: [Self; 8] = [
        Self::Tick,
        Self::OneMinute,
        Self::FiveMinutes,
        Self::FifteenMinutes,
        Self::ThirtyMinutes,
        Self::OneHour,
        Self::FourHours,
        Self::OneDay,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "tick",
            Self::OneMinute => "1m",
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::ThirtyMinutes => "30m",
            Self::OneHour => "1h",
            Self::FourHours => "4h",
            Self::OneDay => "1d",
        }
    }

    /// Bar width. Ticks have no fixed step.
    pub const fn step(self) -> Option<Duration> {
        match self {
            Self::Tick => None,
            Self::OneMinute => Some(Duration::minutes(1)),
            Self::FiveMinutes => Some(Duration::minutes(5)),
            Self::FifteenMinutes => Some(Duration::minutes(15)),
            Self::ThirtyMinutes => Some(Duration::minutes(30)),
            Self::OneHour => Some(Duration::hours(1)),
            Self::FourHours => Some(Duration::hours(4)),
            Self::OneDay => Some(Duration::days(1)),
        }
    }

    pub const fn is_bar(self) -> bool {
        !matches!(self, Self::Tick)
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|granularity| granularity.as_str() == normalized)
            .ok_or(ValidationError::InvalidGranularity { value: normalized })
    }
}
