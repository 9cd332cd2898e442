use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::BatchRequest;
use crate::{Record, SourceId, TimeWindow, UtcDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Pass,
    Warn,
    Reject,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Reject => "REJECT",
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    SchemaViolation,
    OutOfWindow,
    OutOfOrder,
    ConflictingDuplicate,
    GapsDetected,
    MisalignedTimestamp,
    Outlier,
    SourceDivergence,
    PartialData,
}

impl DiagnosticCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SchemaViolation => "schema_violation",
            Self::OutOfWindow => "out_of_window",
            Self::OutOfOrder => "out_of_order",
            Self::ConflictingDuplicate => "conflicting_duplicate",
            Self::GapsDetected => "gaps_detected",
            Self::MisalignedTimestamp => "misaligned_timestamp",
            Self::Outlier => "outlier",
            Self::SourceDivergence => "source_divergence",
            Self::PartialData => "partial_data",
        }
    }

    pub const fn severity(self) -> Outcome {
        match self {
            Self::SchemaViolation => Outcome::Reject,
            _ => Outcome::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub ts: Option<UtcDateTime>,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, ts: Option<UtcDateTime>, detail: impl Into<String>) -> Self {
        Self {
            code,
            ts,
            detail: detail.into(),
        }
    }
}

/// A timestamp that appeared more than once in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub ts: UtcDateTime,
    pub occurrences: usize,
    pub conflicting: bool,
}

/// Disagreement with another source's stored value at the same timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDivergence {
    pub ts: UtcDateTime,
    pub other_source: SourceId,
    pub value: f64,
    pub other_value: f64,
    pub relative_diff: f64,
}

/// Result of validating one batch. Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub batch_id: Uuid,
    pub outcome: Outcome,
    pub diagnostics: Vec<Diagnostic>,
    pub gaps: Vec<TimeWindow>,
    pub duplicates: Vec<DuplicateRecord>,
    pub resolved_gaps: Vec<TimeWindow>,
    pub divergences: Vec<SourceDivergence>,
}

impl QualityVerdict {
    pub fn has(&self, code: DiagnosticCode) -> bool {
        self.diagnostics.iter().any(|diagnostic| diagnostic.code == code)
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.diagnostics
            .iter()
            .map(|diagnostic| diagnostic.code.as_str())
            .collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct VerdictBuilder {
    pub diagnostics: Vec<Diagnostic>,
    pub gaps: Vec<TimeWindow>,
    pub duplicates: Vec<DuplicateRecord>,
    pub resolved_gaps: Vec<TimeWindow>,
    pub divergences: Vec<SourceDivergence>,
}

impl VerdictBuilder {
    pub fn push(&mut self, code: DiagnosticCode, ts: Option<UtcDateTime>, detail: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(code, ts, detail));
    }

    pub fn rejected(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|diagnostic| diagnostic.code.severity() == Outcome::Reject)
    }

    pub fn build(self) -> QualityVerdict {
        let outcome = self
            .diagnostics
            .iter()
            .map(|diagnostic| diagnostic.code.severity())
            .max()
            .unwrap_or(Outcome::Pass);

        QualityVerdict {
            batch_id: Uuid::new_v4(),
            outcome,
            diagnostics: self.diagnostics,
            gaps: self.gaps,
            duplicates: self.duplicates,
            resolved_gaps: self.resolved_gaps,
            divergences: self.divergences,
        }
    }
}

/// Normalized batch ready for the data manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedBatch {
    pub request: BatchRequest,
    /// Deduplicated, ordered, in-window records. Empty when rejected.
    pub records: Vec<Record>,
    /// Confirmed sub-ranges of the window.
    pub present: Vec<TimeWindow>,
    /// Expected slots that had no record.
    pub missing: Vec<TimeWindow>,
    pub verdict: QualityVerdict,
}

impl ValidatedBatch {
    pub fn outcome(&self) -> Outcome {
        self.verdict.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_the_most_severe_diagnostic() {
        let mut builder = VerdictBuilder::default();
        assert_eq!(VerdictBuilder::default().build().outcome, Outcome::Pass);

        builder.push(DiagnosticCode::Outlier, None, "z=5.1");
        builder.push(DiagnosticCode::SchemaViolation, None, "negative volume");
        let verdict = builder.build();

        assert_eq!(verdict.outcome, Outcome::Reject);
        assert_eq!(verdict.codes(), vec!["outlier", "schema_violation"]);
    }

    #[test]
    fn outcome_serializes_in_upper_case() {
        let json = serde_json::to_string(&Outcome::Warn).expect("serialize");
        assert_eq!(json, "\"WARN\"");
    }
}
