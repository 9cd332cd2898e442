use std::sync::Arc;

use tickpipe_warehouse::{
    AuditRow, DeactivationRow, GapRow, JobRow, LedgerRow, RecordRow, SeriesRef, TransitionRow,
    Warehouse, WarehouseError, WritePolicy,
};

use crate::ledger::{LedgerSnapshot, SeriesKey};
use crate::quality::{BatchRequest, QualityVerdict};
use crate::scheduler::{FetchJob, JobId, JobState};
use crate::storage::{
    AuditEntry, ConflictPolicy, Deactivation, JobStore, JobTransition, LedgerStore,
    StorageError, StorageFuture, StorageGateway,
};
use crate::{
    AssetClass, Granularity, InstrumentId, Record, RecordFields, SourceId, TimeWindow,
    UtcDateTime,
};

/// DuckDB-backed storage. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct WarehouseStore {
    warehouse: Arc<Warehouse>,
}

impl WarehouseStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse: Arc::new(warehouse),
        }
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Warehouse) -> Result<T, WarehouseError> + Send + 'static,
    {
        let warehouse = Arc::clone(&self.warehouse);
        tokio::task::spawn_blocking(move || operation(&warehouse))
            .await
            .map_err(|error| StorageError::Unavailable {
                message: error.to_string(),
            })?
            .map_err(storage_error)
    }
}

impl std::fmt::Debug for WarehouseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseStore")
            .field("db_path", &self.warehouse.db_path())
            .finish()
    }
}

fn storage_error(error: WarehouseError) -> StorageError {
    match &error {
        WarehouseError::DuckDb(inner) if inner.to_string().contains("Constraint Error") => {
            StorageError::conflict(error.to_string())
        }
        WarehouseError::Io(_) => StorageError::Unavailable {
            message: error.to_string(),
        },
        _ => StorageError::backend(error.to_string()),
    }
}

fn decode_error(error: impl std::fmt::Display) -> StorageError {
    StorageError::backend(format!("stored row could not be decoded: {error}"))
}

const fn write_policy(policy: ConflictPolicy) -> WritePolicy {
    match policy {
        ConflictPolicy::ReplaceIfChanged => WritePolicy::ReplaceIfChanged,
        ConflictPolicy::AlwaysReplace => WritePolicy::AlwaysReplace,
        ConflictPolicy::KeepExisting => WritePolicy::KeepExisting,
    }
}

fn series_ref(instrument: &InstrumentId, granularity: Granularity) -> SeriesRef {
    SeriesRef {
        symbol: instrument.symbol.as_str().to_owned(),
        asset_class: instrument.asset_class.as_str().to_owned(),
        exchange: instrument.exchange.clone(),
        granularity: granularity.as_str().to_owned(),
    }
}

fn to_row(record: &Record) -> RecordRow {
    let mut row = RecordRow {
        series: series_ref(&record.instrument, record.granularity),
        ts_ns: record.ts.unix_nanos(),
        source: record.source.as_str().to_owned(),
        kind: String::new(),
        open: None,
        high: None,
        low: None,
        close: None,
        volume: None,
        price: None,
        size: None,
        ingested_at_ns: record.ingested_at.unix_nanos(),
        is_adjusted: record.is_adjusted,
    };
    match record.fields {
        RecordFields::Bar {
            open,
            high,
            low,
            close,
            volume,
        } => {
            row.kind = String::from("bar");
            row.open = Some(open);
            row.high = Some(high);
            row.low = Some(low);
            row.close = Some(close);
            row.volume = Some(volume);
        }
        RecordFields::Tick { price, size } => {
            row.kind = String::from("tick");
            row.price = Some(price);
            row.size = Some(size);
        }
    }
    row
}

fn from_row(row: RecordRow) -> Result<Record, StorageError> {
    let instrument = instrument_from(&row.series.symbol, &row.series.asset_class, &row.series.exchange)?;
    let granularity = row
        .series
        .granularity
        .parse::<Granularity>()
        .map_err(decode_error)?;
    let fields = match (row.kind.as_str(), row.open, row.high, row.low, row.close, row.volume) {
        ("bar", Some(open), Some(high), Some(low), Some(close), Some(volume)) => RecordFields::Bar {
            open,
            high,
            low,
            close,
            volume,
        },
        ("tick", ..) => match (row.price, row.size) {
            (Some(price), Some(size)) => RecordFields::Tick { price, size },
            _ => return Err(decode_error("tick row without price or size")),
        },
        (kind, ..) => return Err(decode_error(format!("incomplete '{kind}' row"))),
    };

    Ok(Record {
        instrument,
        granularity,
        ts: UtcDateTime::from_unix_nanos(row.ts_ns).map_err(decode_error)?,
        fields,
        source: SourceId::parse(&row.source).map_err(decode_error)?,
        ingested_at: UtcDateTime::from_unix_nanos(row.ingested_at_ns).map_err(decode_error)?,
        is_adjusted: row.is_adjusted,
    })
}

fn instrument_from(symbol: &str, asset_class: &str, exchange: &str) -> Result<InstrumentId, StorageError> {
    let asset_class = asset_class.parse::<AssetClass>().map_err(decode_error)?;
    InstrumentId::new(symbol, asset_class, exchange).map_err(decode_error)
}

fn job_row(job: &FetchJob) -> Result<JobRow, StorageError> {
    Ok(JobRow {
        job_id: job.id.to_string(),
        series: series_ref(&job.instrument, job.granularity),
        source: job.source.as_str().to_owned(),
        data_kind: job.data_kind.as_str().to_owned(),
        priority_class: job.priority.class.as_str().to_owned(),
        state: job.state.as_str().to_owned(),
        attempt_count: i64::from(job.attempt_count),
        last_error: job.last_error.clone(),
        next_attempt_at_ns: job.next_attempt_at.map(UtcDateTime::unix_nanos),
        updated_at_ns: job.updated_at.unix_nanos(),
        job_json: serde_json::to_string(job).map_err(|error| StorageError::backend(error.to_string()))?,
    })
}

fn transition_from(row: TransitionRow) -> Result<JobTransition, StorageError> {
    let from = match row.from_state {
        Some(state) => Some(state.parse::<JobState>().map_err(decode_error)?),
        None => None,
    };
    Ok(JobTransition {
        job_id: row.job_id.parse::<JobId>().map_err(decode_error)?,
        from,
        to: row.to_state.parse::<JobState>().map_err(decode_error)?,
        attempt: u32::try_from(row.attempt).map_err(decode_error)?,
        error: row.error,
        at: UtcDateTime::from_unix_nanos(row.at_ns).map_err(decode_error)?,
    })
}

impl StorageGateway for WarehouseStore {
    fn upsert<'a>(&'a self, records: &'a [Record], policy: ConflictPolicy) -> StorageFuture<'a, usize> {
        Box::pin(async move {
            let rows: Vec<RecordRow> = records.iter().map(to_row).collect();
            let policy = write_policy(policy);
            self.blocking(move |warehouse| warehouse.upsert_records(&rows, policy))
                .await
        })
    }

    fn query_range<'a>(&'a self, key: &'a SeriesKey, window: TimeWindow) -> StorageFuture<'a, Vec<Record>> {
        Box::pin(async move {
            let series = series_ref(&key.instrument, key.granularity);
            let start = window.start().unix_nanos();
            let end = window.end().unix_nanos();
            let rows = self
                .blocking(move |warehouse| warehouse.query_records(&series, start, end))
                .await?;
            rows.into_iter().map(from_row).collect()
        })
    }

    fn record_verdict<'a>(
        &'a self,
        request: &'a BatchRequest,
        verdict: &'a QualityVerdict,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let encode = |error: serde_json::Error| StorageError::backend(error.to_string());
            let row = AuditRow {
                batch_id: verdict.batch_id.to_string(),
                series: series_ref(&request.instrument, request.granularity),
                source: request.source.as_str().to_owned(),
                data_kind: request.kind.as_str().to_owned(),
                window_start_ns: request.window.start().unix_nanos(),
                window_end_ns: request.window.end().unix_nanos(),
                outcome: verdict.outcome.as_str().to_owned(),
                request_json: serde_json::to_string(request).map_err(encode)?,
                verdict_json: serde_json::to_string(verdict).map_err(encode)?,
                recorded_at_ns: UtcDateTime::now().unix_nanos(),
            };
            self.blocking(move |warehouse| warehouse.record_audit(&row)).await
        })
    }

    fn audit_trail<'a>(&'a self, instrument: &'a InstrumentId) -> StorageFuture<'a, Vec<AuditEntry>> {
        Box::pin(async move {
            let symbol = instrument.symbol.as_str().to_owned();
            let asset_class = instrument.asset_class.as_str();
            let exchange = instrument.exchange.clone();
            let rows = self
                .blocking(move |warehouse| warehouse.audit_trail(&symbol, asset_class, &exchange))
                .await?;
            rows.into_iter()
                .map(|row| {
                    Ok(AuditEntry {
                        request: serde_json::from_str(&row.request_json).map_err(decode_error)?,
                        verdict: serde_json::from_str(&row.verdict_json).map_err(decode_error)?,
                        recorded_at: UtcDateTime::from_unix_nanos(row.recorded_at_ns)
                            .map_err(decode_error)?,
                    })
                })
                .collect()
        })
    }
}

impl JobStore for WarehouseStore {
    fn record_transition<'a>(
        &'a self,
        job: &'a FetchJob,
        from: Option<JobState>,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let row = job_row(job)?;
            let transition = TransitionRow {
                job_id: row.job_id.clone(),
                from_state: from.map(|state| state.as_str().to_owned()),
                to_state: job.state.as_str().to_owned(),
                attempt: i64::from(job.attempt_count),
                error: job.last_error.clone(),
                at_ns: job.updated_at.unix_nanos(),
            };
            self.blocking(move |warehouse| warehouse.save_job(&row, &transition))
                .await
        })
    }

    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<FetchJob>> {
        Box::pin(async move {
            let rows = self.blocking(|warehouse| warehouse.load_jobs()).await?;
            rows.into_iter()
                .map(|row| serde_json::from_str::<FetchJob>(&row.job_json).map_err(decode_error))
                .collect()
        })
    }

    fn history<'a>(&'a self, job_id: JobId) -> StorageFuture<'a, Vec<JobTransition>> {
        Box::pin(async move {
            let id = job_id.to_string();
            let rows = self
                .blocking(move |warehouse| warehouse.job_history(&id))
                .await?;
            rows.into_iter().map(transition_from).collect()
        })
    }

    fn deactivate<'a>(
        &'a self,
        instrument: &'a InstrumentId,
        source: &'a SourceId,
        reason: &'a str,
    ) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let row = DeactivationRow {
                symbol: instrument.symbol.as_str().to_owned(),
                asset_class: instrument.asset_class.as_str().to_owned(),
                exchange: instrument.exchange.clone(),
                source: source.as_str().to_owned(),
                reason: reason.to_owned(),
                at_ns: UtcDateTime::now().unix_nanos(),
            };
            self.blocking(move |warehouse| warehouse.deactivate(&row)).await
        })
    }

    fn deactivations<'a>(&'a self) -> StorageFuture<'a, Vec<Deactivation>> {
        Box::pin(async move {
            let rows = self.blocking(|warehouse| warehouse.deactivations()).await?;
            rows.into_iter()
                .map(|row| {
                    Ok(Deactivation {
                        instrument: instrument_from(&row.symbol, &row.asset_class, &row.exchange)?,
                        source: SourceId::parse(&row.source).map_err(decode_error)?,
                        reason: row.reason,
                        at: UtcDateTime::from_unix_nanos(row.at_ns).map_err(decode_error)?,
                    })
                })
                .collect()
        })
    }
}

impl LedgerStore for WarehouseStore {
    fn save<'a>(&'a self, snapshot: &'a LedgerSnapshot) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let row = LedgerRow {
                series: series_ref(&snapshot.key.instrument, snapshot.key.granularity),
                watermark_ns: snapshot
                    .watermark
                    .as_ref()
                    .map(|watermark| watermark.last_confirmed.unix_nanos()),
                snapshot_json: serde_json::to_string(snapshot)
                    .map_err(|error| StorageError::backend(error.to_string()))?,
                updated_at_ns: UtcDateTime::now().unix_nanos(),
                gaps: snapshot
                    .gaps
                    .iter()
                    .map(|gap| GapRow {
                        start_ns: gap.start.unix_nanos(),
                        end_ns: gap.end.unix_nanos(),
                        discovered_at_ns: gap.discovered_at.unix_nanos(),
                        resolved_at_ns: gap.resolved_at.map(UtcDateTime::unix_nanos),
                    })
                    .collect(),
            };
            self.blocking(move |warehouse| warehouse.save_ledger(&row)).await
        })
    }

    fn load_all<'a>(&'a self) -> StorageFuture<'a, Vec<LedgerSnapshot>> {
        Box::pin(async move {
            let rows = self.blocking(|warehouse| warehouse.load_ledger()).await?;
            rows.into_iter()
                .map(|row| serde_json::from_str::<LedgerSnapshot>(&row.snapshot_json).map_err(decode_error))
                .collect()
        })
    }
}
