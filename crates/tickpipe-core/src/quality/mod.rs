//! Batch validation: schema, ordering, duplicates, gaps, outliers and
//! cross-source reconciliation.

mod outlier;
mod reconcile;
mod verdict;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ledger::{diff_gaps, IntervalSet, LedgerView};
use crate::{
    AssetClass, DataKind, Granularity, InstrumentId, Record, SessionCalendar, SourceId,
    TimeWindow, UtcDateTime,
};

pub use outlier::{OutlierDetector, OutlierHit};
pub use reconcile::reconcile;
pub use verdict::{
    Diagnostic, DiagnosticCode, DuplicateRecord, Outcome, QualityVerdict, SourceDivergence,
    ValidatedBatch,
};

use verdict::VerdictBuilder;

/// What was asked of the adapter for this batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub instrument: InstrumentId,
    pub source: SourceId,
    pub window: TimeWindow,
    pub granularity: Granularity,
    pub kind: DataKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub z_threshold: f64,
    /// Trailing returns used for the z-score.
    pub lookback: usize,
    pub min_samples: usize,
    /// Relative close/price difference tolerated between sources.
    pub reconciliation_tolerance: f64,
    pub calendars: BTreeMap<AssetClass, SessionCalendar>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let calendars = AssetClass::ALL
            .into_iter()
            .map(|class| {
                let calendar = match class {
                    AssetClass::Crypto => SessionCalendar::Continuous,
                    _ => SessionCalendar::Weekdays,
                };
                (class, calendar)
            })
            .collect();

        Self {
            z_threshold: 4.0,
            lookback: 20,
            min_samples: 5,
            reconciliation_tolerance: 0.0001,
            calendars,
        }
    }
}

impl QualityConfig {
    pub fn calendar(&self, asset_class: AssetClass) -> SessionCalendar {
        self.calendars.get(&asset_class).copied().unwrap_or_default()
    }
}

/// State the engine needs from storage and the ledger, gathered by the data manager.
#[derive(Debug, Clone, Default)]
pub struct QualityContext {
    pub ledger: LedgerView,
    /// Resolved closes immediately before the window, oldest first.
    pub prior_closes: Vec<f64>,
    /// Stored records of other sources inside the window.
    pub other_sources: Vec<Record>,
}

/// Stateless validator turning raw adapter output into a [`ValidatedBatch`].
#[derive(Debug, Clone, Default)]
pub struct QualityEngine {
    config: QualityConfig,
}

impl QualityEngine {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Validates `raw`. `expected` is set when the adapter reported a partial response.
    pub fn validate(
        &self,
        request: &BatchRequest,
        raw: Vec<Record>,
        expected: Option<usize>,
        context: &QualityContext,
    ) -> ValidatedBatch {
        let mut builder = VerdictBuilder::default();

        let records = self.check_schema(request, raw, &mut builder);
        if builder.rejected() {
            return self.finish(request, Vec::new(), Vec::new(), Vec::new(), builder);
        }

        let records = check_ordering(records, &mut builder);
        let records = check_duplicates(records, &mut builder);

        if let Some(expected) = expected {
            builder.push(
                DiagnosticCode::PartialData,
                None,
                format!("{} of {expected} records returned", records.len()),
            );
        }

        let (present, missing) = self.check_gaps(request, &records, expected.is_some(), context, &mut builder);

        if request.kind == DataKind::Historical && request.granularity.is_bar() {
            self.check_outliers(&records, context, &mut builder);
        }
        self.check_reconciliation(&records, context, &mut builder);

        self.finish(request, records, present, missing, builder)
    }

    fn finish(
        &self,
        request: &BatchRequest,
        records: Vec<Record>,
        present: Vec<TimeWindow>,
        missing: Vec<TimeWindow>,
        builder: VerdictBuilder,
    ) -> ValidatedBatch {
        let verdict = builder.build();
        match verdict.outcome {
            Outcome::Pass => tracing::debug!(
                batch_id = %verdict.batch_id,
                instrument = %request.instrument,
                source = %request.source,
                records = records.len(),
                "batch passed"
            ),
            outcome => tracing::warn!(
                batch_id = %verdict.batch_id,
                instrument = %request.instrument,
                source = %request.source,
                window = %request.window,
                outcome = %outcome,
                codes = ?verdict.codes(),
                "batch flagged"
            ),
        }

        ValidatedBatch {
            request: request.clone(),
            records,
            present,
            missing,
            verdict,
        }
    }

    fn check_schema(
        &self,
        request: &BatchRequest,
        raw: Vec<Record>,
        builder: &mut VerdictBuilder,
    ) -> Vec<Record> {
        let mut kept = Vec::with_capacity(raw.len());
        let mut out_of_window = 0_usize;

        for record in raw {
            let violation = if record.instrument != request.instrument {
                Some(format!("record for '{}' in batch for '{}'", record.instrument, request.instrument))
            } else if record.source != request.source {
                Some(format!("record from '{}' in batch for '{}'", record.source, request.source))
            } else if record.granularity != request.granularity
                || record.fields.is_bar() != request.granularity.is_bar()
            {
                Some(format!(
                    "record granularity '{}' does not match '{}'",
                    record.granularity, request.granularity
                ))
            } else {
                record.validate().err().map(|err| err.to_string())
            };

            if let Some(detail) = violation {
                builder.push(DiagnosticCode::SchemaViolation, Some(record.ts), detail);
                continue;
            }

            if !request.window.contains(record.ts) {
                out_of_window += 1;
                continue;
            }
            kept.push(record);
        }

        if out_of_window > 0 {
            builder.push(
                DiagnosticCode::OutOfWindow,
                None,
                format!("{out_of_window} records outside {} discarded", request.window),
            );
        }
        kept
    }

    fn check_gaps(
        &self,
        request: &BatchRequest,
        records: &[Record],
        partial: bool,
        context: &QualityContext,
        builder: &mut VerdictBuilder,
    ) -> (Vec<TimeWindow>, Vec<TimeWindow>) {
        let window = request.window;
        let (present, missing) = match request.granularity.step() {
            Some(step) => {
                let calendar = self.config.calendar(request.instrument.asset_class);
                let mut misaligned = 0_usize;
                let mut seen = std::collections::BTreeSet::new();
                for record in records {
                    if record.ts.floor_to(step) == record.ts {
                        seen.insert(record.ts);
                    } else {
                        misaligned += 1;
                        if misaligned == 1 {
                            builder.push(
                                DiagnosticCode::MisalignedTimestamp,
                                Some(record.ts),
                                format!("timestamp is not on the {} grid", request.granularity),
                            );
                        }
                    }
                }

                let missing = IntervalSet::from_windows(
                    window
                        .expected_slots(step, calendar)
                        .into_iter()
                        .filter(|slot| !seen.contains(slot))
                        .filter_map(|slot| TimeWindow::new(slot, slot.saturating_add(step)).ok()),
                );
                let present = IntervalSet::from_windows([window]).subtract(&missing);
                (present, missing)
            }
            None => {
                let present = match (partial, records.last()) {
                    (false, _) => IntervalSet::from_windows([window]),
                    (true, Some(last)) => IntervalSet::from_windows(
                        TimeWindow::new(window.start(), last.ts.saturating_add(time::Duration::nanoseconds(1))).ok(),
                    ),
                    (true, None) => IntervalSet::new(),
                };
                (present, IntervalSet::new())
            }
        };

        let diff = diff_gaps(
            &context.ledger.coverage,
            &context.ledger.open_gaps,
            &missing,
            &present,
        );
        if !diff.new_gaps.is_empty() {
            let detail = diff
                .new_gaps
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            builder.push(
                DiagnosticCode::GapsDetected,
                diff.new_gaps.first().map(TimeWindow::start),
                format!("{} new gaps: {detail}", diff.new_gaps.len()),
            );
        }
        builder.gaps = diff.new_gaps;
        builder.resolved_gaps = diff.resolved;

        (present.windows(), missing.windows())
    }

    fn check_outliers(&self, records: &[Record], context: &QualityContext, builder: &mut VerdictBuilder) {
        let detector = OutlierDetector {
            threshold: self.config.z_threshold,
            lookback: self.config.lookback,
            min_samples: self.config.min_samples,
        };
        let closes: Vec<(UtcDateTime, f64)> = records
            .iter()
            .map(|record| (record.ts, record.reference_price()))
            .collect();

        for hit in detector.scan(&context.prior_closes, &closes) {
            builder.push(
                DiagnosticCode::Outlier,
                Some(hit.ts),
                format!("return {:.4} has z-score {:.2}", hit.simple_return, hit.z_score),
            );
        }
    }

    fn check_reconciliation(
        &self,
        records: &[Record],
        context: &QualityContext,
        builder: &mut VerdictBuilder,
    ) {
        let divergences = reconcile(
            records,
            &context.other_sources,
            self.config.reconciliation_tolerance,
        );
        for divergence in &divergences {
            builder.push(
                DiagnosticCode::SourceDivergence,
                Some(divergence.ts),
                format!(
                    "{} vs {} from '{}' ({:.2}bp)",
                    divergence.value,
                    divergence.other_value,
                    divergence.other_source,
                    divergence.relative_diff * 10_000.0
                ),
            );
        }
        builder.divergences = divergences;
    }
}

/// Stable-sorts records that arrived out of order.
fn check_ordering(mut records: Vec<Record>, builder: &mut VerdictBuilder) -> Vec<Record> {
    let first_inversion = records
        .windows(2)
        .find(|pair| pair[1].ts < pair[0].ts)
        .map(|pair| pair[1].ts);

    if let Some(ts) = first_inversion {
        builder.push(
            DiagnosticCode::OutOfOrder,
            Some(ts),
            "records were not strictly increasing and have been sorted",
        );
        records.sort_by_key(|record| record.ts);
    }
    records
}

/// Collapses repeated timestamps. Identical payloads are dropped silently;
/// conflicting ones keep the latest ingested value, then the later position.
fn check_duplicates(records: Vec<Record>, builder: &mut VerdictBuilder) -> Vec<Record> {
    let mut output: Vec<Record> = Vec::with_capacity(records.len());
    let mut group: Vec<Record> = Vec::new();

    let flush = |group: &mut Vec<Record>, output: &mut Vec<Record>, builder: &mut VerdictBuilder| {
        if group.len() > 1 {
            let ts = group[0].ts;
            let conflicting = group.iter().any(|record| !record.same_payload(&group[0]));
            builder.duplicates.push(DuplicateRecord {
                ts,
                occurrences: group.len(),
                conflicting,
            });
            if conflicting {
                builder.push(
                    DiagnosticCode::ConflictingDuplicate,
                    Some(ts),
                    format!("{} differing records share one timestamp", group.len()),
                );
            }
        }
        let winner = group
            .drain(..)
            .enumerate()
            .max_by_key(|(position, record)| (record.ingested_at, *position))
            .map(|(_, record)| record);
        output.extend(winner);
    };

    for record in records {
        if group.first().is_some_and(|head| head.ts != record.ts) {
            flush(&mut group, &mut output, builder);
        }
        group.push(record);
    }
    flush(&mut group, &mut output, builder);
    output
}
