use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::ledger::{LedgerSnapshot, SeriesKey};
use crate::quality::{BatchRequest, QualityVerdict};
use crate::scheduler::{FetchJob, JobId, JobState};
use crate::storage::{
    AuditEntry, ConflictPolicy, Deactivation, JobStore, JobTransition, LedgerStore,
    StorageFuture, StorageGateway,
};
use crate::{InstrumentId, Record, SourceId, TimeWindow, UtcDateTime};

type SeriesRows = BTreeMap<(UtcDateTime, SourceId), Record>;

/// In-process implementation of every storage seam, used by tests and
/// dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<SeriesKey, SeriesRows>>,
    audit: Mutex<Vec<AuditEntry>>,
    jobs: Mutex<BTreeMap<JobId, FetchJob>>,
    history: Mutex<Vec<JobTransition>>,
    deactivations: Mutex<Vec<Deactivation>>,
    ledger: Mutex<BTreeMap<SeriesKey, LedgerSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored rows across all series.
    pub fn record_count(&self) -> usize {
        lock(&self.records).values().map(BTreeMap::len).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StorageGateway for MemoryStore {
    fn upsert<'a>(&'a self, records: &'a [Record], policy: ConflictPolicy) -> StorageFuture<'a, usize> {
        Box::pin(async move {
            let mut store = lock(&self.records);
            let mut written = 0;
            for record in records {
                let key = SeriesKey::new(record.instrument.clone(), record.granularity);
                let rows = store.entry(key).or_default();
                let row_key = (record.ts, record.source.clone());
                if policy.should_write(rows.get(&row_key), record) {
                    rows.insert(row_key, record.clone());
                    written += 1;
                }
            }
            Ok(written)
        })
    }

    fn query_range<'a>(&'a self, key: &'a SeriesKey, window: TimeWindow) -> StorageFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let store = lock(&self.records);
            let Some(rows) = store.get(key) else {
                return Ok(Vec::new());
            };
            Ok(rows
                .iter()
                .filter(|((ts, _), _)| window.contains(*ts))
                .map(|(_, record)| record.clone())
                .collect())
        })
    }

    fn record_verdict<'a>(
        &'a self,
        request: &'a BatchRequest,
        verdict: &'a QualityVerdict,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.audit).push(AuditEntry {
                request: request.clone(),
                verdict: verdict.clone(),
                recorded_at: UtcDateTime::now(),
            });
            Ok(())
        })
    }

    fn audit_trail<'a>(&'a self, instrument: &'a InstrumentId) -> StorageFuture<'a, Vec<AuditEntry>> {
        Box::pin(async move {
            Ok(lock(&self.audit)
                .iter()
                .filter(|entry| &entry.request.instrument == instrument)
                .cloned()
                .collect())
        })
    }
}

impl JobStore for MemoryStore {
    fn record_transition<'a>(
        &'a self,
        job: &'a FetchJob,
        from: Option<JobState>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.jobs).insert(job.id, job.clone());
            lock(&self.history).push(JobTransition {
                job_id: job.id,
                from,
                to: job.state,
                attempt: job.attempt_count,
                error: job.last_error.clone(),
                at: job.updated_at,
            });
            Ok(())
        })
    }

    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<FetchJob>> {
        Box::pin(async move { Ok(lock(&self.jobs).values().cloned().collect()) })
    }

    fn history<'a>(&'a self, job_id: JobId) -> StorageFuture<'a, Vec<JobTransition>> {
        Box::pin(async move {
            Ok(lock(&self.history)
                .iter()
                .filter(|transition| transition.job_id == job_id)
                .cloned()
                .collect())
        })
    }

    fn deactivate<'a>(
        &'a self,
        instrument: &'a InstrumentId,
        source: &'a SourceId,
        reason: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut deactivations = lock(&self.deactivations);
            let exists = deactivations
                .iter()
                .any(|entry| &entry.instrument == instrument && &entry.source == source);
            if !exists {
                deactivations.push(Deactivation {
                    instrument: instrument.clone(),
                    source: source.clone(),
                    reason: reason.to_owned(),
                    at: UtcDateTime::now(),
                });
            }
            Ok(())
        })
    }

    fn deactivations<'a>(&'a self) -> StorageFuture<'a, Vec<Deactivation>> {
        Box::pin(async move { Ok(lock(&self.deactivations).clone()) })
    }
}

impl LedgerStore for MemoryStore {
    fn save<'a>(&'a self, snapshot: &'a LedgerSnapshot) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            lock(&self.ledger).insert(snapshot.key.clone(), snapshot.clone());
            Ok(())
        })
    }

    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<LedgerSnapshot>> {
        Box::pin(async move { Ok(lock(&self.ledger).values().cloned().collect()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssetClass, Granularity};

    fn bar(day: u32, close: f64) -> Record {
        Record::bar(
            InstrumentId::new("AAPL", AssetClass::Equity, "XNAS").expect("id"),
            Granularity::OneDay,
            UtcDateTime::parse(&format!("2024-01-{day:02}T00:00:00Z")).expect("ts"),
            close,
            close,
            close,
            close,
            1.0,
            SourceId::parse("simulated").expect("source"),
        )
    }

    #[tokio::test]
    async fn replace_if_changed_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![bar(2, 10.0), bar(3, 11.0)];

        let first = store
            .upsert(&batch, ConflictPolicy::ReplaceIfChanged)
            .await
            .expect("upsert");
        let second = store
            .upsert(&batch, ConflictPolicy::ReplaceIfChanged)
            .await
            .expect("upsert");

        assert_eq!(first, 2);
        assert_eq!(second, 0);
        assert_eq!(store.record_count(), 2);
    }

    #[tokio::test]
    async fn query_range_respects_half_open_window() {
        let store = MemoryStore::new();
        store
            .upsert(&[bar(1, 1.0), bar(2, 2.0), bar(3, 3.0)], ConflictPolicy::AlwaysReplace)
            .await
            .expect("upsert");

        let key = SeriesKey::new(bar(1, 1.0).instrument, Granularity::OneDay);
        let window = TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-03T00:00:00Z").expect("window");
        let rows = <MemoryStore as StorageGateway>::query_range(&store, &key, window)
            .await
            .expect("query");
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn deactivation_is_recorded_once() {
        let store = MemoryStore::new();
        let instrument = InstrumentId::new("ZZZZ", AssetClass::Equity, "XNAS").expect("id");
        let source = SourceId::parse("simulated").expect("source");

        store.deactivate(&instrument, &source, "unknown symbol").await.expect("deactivate");
        store.deactivate(&instrument, &source, "unknown symbol").await.expect("deactivate");

        assert_eq!(store.deactivations().await.expect("list").len(), 1);
    }
}
