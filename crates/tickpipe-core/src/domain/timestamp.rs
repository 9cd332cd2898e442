use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};

use crate::ValidationError;

/// RFC3339 timestamp guaranteed to be UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UtcDateTime(OffsetDateTime);

impl UtcDateTime {
    pub fn now() -> Self {
        Self(OffsetDateTime::now_utc())
    }

    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let parsed = OffsetDateTime::parse(input, &Rfc3339).map_err(|_| {
            ValidationError::TimestampNotUtc {
                value: input.to_owned(),
            }
        })?;

        Self::from_offset_datetime(parsed).map_err(|_| ValidationError::TimestampNotUtc {
            value: input.to_owned(),
        })
    }

    pub fn from_offset_datetime(value: OffsetDateTime) -> Result<Self, ValidationError> {
        if value.offset() != UtcOffset::UTC {
            return Err(ValidationError::TimestampNotUtc {
                value: value
                    .format(&Rfc3339)
                    .unwrap_or_else(|_| String::from("<unformattable>")),
            });
        }

        Ok(Self(value))
    }

    /// Builds a timestamp from nanoseconds since the Unix epoch.
    pub fn from_unix_nanos(nanos: i64) -> Result<Self, ValidationError> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(nanos))
            .map(Self)
            .map_err(|_| ValidationError::TimestampOutOfRange {
                value: i128::from(nanos),
            })
    }

    /// Nanoseconds since the Unix epoch, saturating outside the `i64` range.
    pub fn unix_nanos(self) -> i64 {
        let nanos = self.0.unix_timestamp_nanos();
        i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration))
    }

    /// Signed distance `self - earlier`.
    pub fn since(self, earlier: Self) -> Duration {
        self.0 - earlier.0
    }

    /// Truncates the timestamp down to a multiple of `step` since the epoch.
    pub fn floor_to(self, step: Duration) -> Self {
        let step_nanos = step.whole_nanoseconds();
        if step_nanos <= 0 {
            return self;
        }
        let nanos = self.0.unix_timestamp_nanos();
        let floored = nanos - nanos.rem_euclid(step_nanos);
        OffsetDateTime::from_unix_timestamp_nanos(floored)
            .map(Self)
            .unwrap_or(self)
    }

    pub fn weekday(self) -> time::Weekday {
        self.0.weekday()
    }

    pub fn format_rfc3339(self) -> String {
        self.0
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.0.unix_timestamp().to_string())
    }
}

impl Display for UtcDateTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.format_rfc3339())
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.format_rfc3339())
    }
}

impl<'de> Deserialize<'de> for UtcDateTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::parse(&value).map_err(D::Error::custom)
    }
}
