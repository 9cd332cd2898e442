use serde::{Deserialize, Serialize};

use crate::{Granularity, InstrumentId, SourceId, UtcDateTime, ValidationError};

/// Whether data was requested for a past window or arrived on a live feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Historical,
    Realtime,
}

impl DataKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::Realtime => "realtime",
        }
    }
}

/// Payload of a canonical market data record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordFields {
    Bar {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    },
    Tick {
        price: f64,
        size: f64,
    },
}

impl RecordFields {
    /// Close for bars, trade price for ticks.
    pub const fn reference_price(&self) -> f64 {
        match self {
            Self::Bar { close, .. } => *close,
            Self::Tick { price, .. } => *price,
        }
    }

    pub const fn is_bar(&self) -> bool {
        matches!(self, Self::Bar { .. })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Self::Bar {
                open,
                high,
                low,
                close,
                volume,
            } => {
                validate_non_negative("open", open)?;
                validate_non_negative("high", high)?;
                validate_non_negative("low", low)?;
                validate_non_negative("close", close)?;
                validate_non_negative("volume", volume)?;

                if high < low {
                    return Err(ValidationError::InvalidBarRange);
                }
                if open < low || open > high || close < low || close > high {
                    return Err(ValidationError::InvalidBarBounds);
                }
                Ok(())
            }
            Self::Tick { price, size } => {
                validate_non_negative("price", price)?;
                validate_non_negative("size", size)
            }
        }
    }
}

/// Canonical record emitted by source adapters and persisted by the storage gateway.
///
/// Records are immutable once persisted; a newer value for the same
/// `(instrument, granularity, ts, source)` key replaces the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub instrument: InstrumentId,
    pub granularity: Granularity,
    pub ts: UtcDateTime,
    pub fields: RecordFields,
    pub source: SourceId,
    pub ingested_at: UtcDateTime,
    #[serde(default)]
    pub is_adjusted: bool,
}

impl Record {
    #[allow(clippy::too_many_arguments)]
    pub fn bar(
        instrument: InstrumentId,
        granularity: Granularity,
        ts: UtcDateTime,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        source: SourceId,
    ) -> Self {
        Self {
            instrument,
            granularity,
            ts,
            fields: RecordFields::Bar {
                open,
                high,
                low,
                close,
                volume,
            },
            source,
            ingested_at: UtcDateTime::now(),
            is_adjusted: false,
        }
    }

    pub fn tick(
        instrument: InstrumentId,
        ts: UtcDateTime,
        price: f64,
        size: f64,
        source: SourceId,
    ) -> Self {
        Self {
            instrument,
            granularity: Granularity::Tick,
            ts,
            fields: RecordFields::Tick { price, size },
            source,
            ingested_at: UtcDateTime::now(),
            is_adjusted: false,
        }
    }

    pub fn with_ingested_at(mut self, ingested_at: UtcDateTime) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    pub fn adjusted(mut self, is_adjusted: bool) -> Self {
        self.is_adjusted = is_adjusted;
        self
    }

    pub const fn reference_price(&self) -> f64 {
        self.fields.reference_price()
    }

    /// Equal market content, ignoring ingestion time.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.fields == other.fields && self.is_adjusted == other.is_adjusted
    }

    /// Field and kind checks; does not consult the requested window.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.fields.validate()
    }
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}
