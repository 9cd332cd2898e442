//! Routes validated batches into storage and the gap ledger, and resolves
//! cross-source conflicts on read.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{GapInterval, IntervalSet, Ledger, SeriesKey, Watermark};
use crate::quality::{BatchRequest, Outcome, QualityContext, ValidatedBatch};
use crate::storage::{ConflictPolicy, LedgerStore, StorageError, StorageGateway};
use crate::{Record, SourceId, TimeWindow, UtcDateTime};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("batch {batch_id} rejected by quality checks: {codes}")]
    QualityRejected { batch_id: Uuid, codes: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ManagerError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::QualityRejected { .. } => "quality.rejected",
            Self::Storage(error) => error.code(),
        }
    }
}

/// What a write changed, consumed by the scheduler's prioritization.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub batch_id: Uuid,
    pub outcome: Outcome,
    pub series: SeriesKey,
    /// Rows inserted or changed in storage.
    pub written: usize,
    /// Timestamps where a higher-ranked source already holds the resolved value.
    pub outranked: usize,
    pub new_gaps: Vec<GapInterval>,
    pub resolved_gaps: Vec<GapInterval>,
    /// Set only when the watermark moved forward.
    pub watermark: Option<Watermark>,
}

impl WriteReport {
    pub fn changed_gaps(&self) -> bool {
        !self.new_gaps.is_empty() || !self.resolved_gaps.is_empty()
    }
}

/// Orders candidate records for one timestamp: higher-ranked source first,
/// then most recently ingested, then source id.
#[derive(Debug, Clone, Default)]
pub struct SourceRanking {
    order: Vec<SourceId>,
}

impl SourceRanking {
    pub fn new(order: Vec<SourceId>) -> Self {
        Self { order }
    }

    /// Position in the configured ranking; unlisted sources share the lowest rank.
    pub fn rank(&self, source: &SourceId) -> usize {
        self.order
            .iter()
            .position(|candidate| candidate == source)
            .unwrap_or(self.order.len())
    }

    pub fn compare(&self, left: &Record, right: &Record) -> Ordering {
        self.rank(&left.source)
            .cmp(&self.rank(&right.source))
            .then_with(|| right.ingested_at.cmp(&left.ingested_at))
            .then_with(|| left.source.cmp(&right.source))
    }

    /// The winning record among candidates for the same timestamp.
    pub fn resolve<'r>(&self, candidates: &'r [Record]) -> Option<&'r Record> {
        candidates.iter().min_by(|left, right| self.compare(left, right))
    }
}

/// Orchestrates quality verdicts and storage writes. Shared by workers and
/// the realtime feed; callers serialize work per instrument.
pub struct DataManager {
    storage: Arc<dyn StorageGateway>,
    ledger: Arc<Ledger>,
    ledger_store: Arc<dyn LedgerStore>,
    ranking: SourceRanking,
}

impl DataManager {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        ledger: Arc<Ledger>,
        ledger_store: Arc<dyn LedgerStore>,
        ranking: SourceRanking,
    ) -> Self {
        Self {
            storage,
            ledger,
            ledger_store,
            ranking,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn ranking(&self) -> &SourceRanking {
        &self.ranking
    }

    /// Reloads persisted ledger state. Returns the number of series restored.
    pub async fn restore_ledger(&self) -> Result<usize, StorageError> {
        let snapshots = self.ledger_store.load_all().await?;
        let restored = snapshots.len();
        self.ledger.restore(snapshots);
        tracing::info!(series = restored, "gap ledger restored");
        Ok(restored)
    }

    /// Ledger view, prior resolved closes and other sources' stored records
    /// for validating `request`.
    pub async fn quality_context(
        &self,
        request: &BatchRequest,
        lookback: usize,
    ) -> Result<QualityContext, StorageError> {
        let key = SeriesKey::new(request.instrument.clone(), request.granularity);
        let other_sources = self
            .storage
            .query_range(&key, request.window)
            .await?
            .into_iter()
            .filter(|record| record.source != request.source)
            .collect();

        Ok(QualityContext {
            ledger: self.ledger.view(&key),
            prior_closes: self.prior_closes(&key, request.window, lookback).await?,
            other_sources,
        })
    }

    async fn prior_closes(
        &self,
        key: &SeriesKey,
        window: TimeWindow,
        lookback: usize,
    ) -> Result<Vec<f64>, StorageError> {
        let Some(step) = key.granularity.step() else {
            return Ok(Vec::new());
        };
        // Three slots per wanted close leaves room for weekends and holidays.
        let slots = i32::try_from(lookback.saturating_add(1).saturating_mul(3)).unwrap_or(i32::MAX);
        let start = window.start().saturating_sub(step.saturating_mul(slots));
        let Ok(prior) = TimeWindow::new(start, window.start()) else {
            return Ok(Vec::new());
        };

        let closes: Vec<f64> = self
            .resolved_range(key, prior)
            .await?
            .iter()
            .filter(|record| record.fields.is_bar())
            .map(Record::reference_price)
            .collect();
        let keep = lookback.saturating_add(1);
        Ok(closes[closes.len().saturating_sub(keep)..].to_vec())
    }

    /// One record per timestamp inside `window`, chosen by source ranking.
    pub async fn resolved_range(
        &self,
        key: &SeriesKey,
        window: TimeWindow,
    ) -> Result<Vec<Record>, StorageError> {
        let mut by_ts: BTreeMap<UtcDateTime, Vec<Record>> = BTreeMap::new();
        for record in self.storage.query_range(key, window).await? {
            by_ts.entry(record.ts).or_default().push(record);
        }
        Ok(by_ts
            .values()
            .filter_map(|candidates| self.ranking.resolve(candidates).cloned())
            .collect())
    }

    /// Persists an accepted batch, records its verdict and applies the
    /// ledger delta. A REJECT verdict is audited and refused.
    pub async fn write(&self, batch: ValidatedBatch) -> Result<WriteReport, ManagerError> {
        let request = &batch.request;
        let verdict = &batch.verdict;
        let key = SeriesKey::new(request.instrument.clone(), request.granularity);

        if verdict.outcome == Outcome::Reject {
            self.storage.record_verdict(request, verdict).await?;
            return Err(ManagerError::QualityRejected {
                batch_id: verdict.batch_id,
                codes: verdict.codes().join(","),
            });
        }

        let outranked = self.count_outranked(&key, &batch).await?;
        let written = self
            .storage
            .upsert(&batch.records, ConflictPolicy::ReplaceIfChanged)
            .await?;
        if verdict.outcome == Outcome::Warn {
            self.storage.record_verdict(request, verdict).await?;
        }

        let present = IntervalSet::from_windows(batch.present.iter().copied());
        let missing = IntervalSet::from_windows(batch.missing.iter().copied());
        let delta = self.ledger.apply(&key, &present, &missing, UtcDateTime::now());
        self.ledger_store.save(&self.ledger.snapshot(&key)).await?;

        tracing::info!(
            batch_id = %verdict.batch_id,
            series = %key,
            source = %request.source,
            outcome = %verdict.outcome,
            written,
            outranked,
            new_gaps = delta.new_gaps.len(),
            resolved_gaps = delta.resolved_gaps.len(),
            watermark = ?delta.watermark.map(|watermark| watermark.last_confirmed),
            "batch written"
        );

        Ok(WriteReport {
            batch_id: verdict.batch_id,
            outcome: verdict.outcome,
            series: key,
            written,
            outranked,
            new_gaps: delta.new_gaps,
            resolved_gaps: delta.resolved_gaps,
            watermark: delta.watermark,
        })
    }

    async fn count_outranked(&self, key: &SeriesKey, batch: &ValidatedBatch) -> Result<usize, StorageError> {
        if batch.records.is_empty() {
            return Ok(0);
        }
        let stored = self.storage.query_range(key, batch.request.window).await?;
        let source_rank = self.ranking.rank(&batch.request.source);
        let outranked = batch
            .records
            .iter()
            .filter(|record| {
                stored.iter().any(|other| {
                    other.ts == record.ts
                        && other.source != record.source
                        && self.ranking.rank(&other.source) < source_rank
                })
            })
            .count();
        Ok(outranked)
    }
}
