//! Flat row shapes exchanged with the pipeline. Timestamps are Unix
//! nanoseconds.

use serde::{Deserialize, Serialize};

/// Identifies one stored series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesRef {
    pub symbol: String,
    pub asset_class: String,
    pub exchange: String,
    pub granularity: String,
}

impl SeriesRef {
    /// Stable text key used by the ledger tables.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}@{}",
            self.asset_class, self.exchange, self.symbol, self.granularity
        )
    }
}

/// How an upsert treats a row that already exists under the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    ReplaceIfChanged,
    AlwaysReplace,
    KeepExisting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub series: SeriesRef,
    pub ts_ns: i64,
    pub source: String,
    /// `bar` or `tick`.
    pub kind: String,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub price: Option<f64>,
    pub size: Option<f64>,
    pub ingested_at_ns: i64,
    pub is_adjusted: bool,
}

impl RecordRow {
    /// Compares everything except provenance timestamps.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.price == other.price
            && self.size == other.size
            && self.is_adjusted == other.is_adjusted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub batch_id: String,
    pub series: SeriesRef,
    pub source: String,
    pub data_kind: String,
    pub window_start_ns: i64,
    pub window_end_ns: i64,
    pub outcome: String,
    pub request_json: String,
    pub verdict_json: String,
    pub recorded_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRow {
    pub job_id: String,
    pub series: SeriesRef,
    pub source: String,
    pub data_kind: String,
    pub priority_class: String,
    pub state: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
    pub next_attempt_at_ns: Option<i64>,
    pub updated_at_ns: i64,
    pub job_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRow {
    pub job_id: String,
    pub from_state: Option<String>,
    pub to_state: String,
    pub attempt: i64,
    pub error: Option<String>,
    pub at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCount {
    pub state: String,
    pub jobs: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRow {
    pub start_ns: i64,
    pub end_ns: i64,
    pub discovered_at_ns: i64,
    pub resolved_at_ns: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenGapRow {
    pub series: SeriesRef,
    pub start_ns: i64,
    pub end_ns: i64,
    pub discovered_at_ns: i64,
}

/// Persisted ledger state of one series. `snapshot_json` is authoritative;
/// `gaps` feeds the review views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub series: SeriesRef,
    pub watermark_ns: Option<i64>,
    pub snapshot_json: String,
    pub updated_at_ns: i64,
    pub gaps: Vec<GapRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivationRow {
    pub symbol: String,
    pub asset_class: String,
    pub exchange: String,
    pub source: String,
    pub reason: String,
    pub at_ns: i64,
}
