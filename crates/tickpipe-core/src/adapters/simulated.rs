use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::adapters::{FetchError, FetchFuture, RateLimitInfo, RecordStream, SourceAdapter};
use crate::throttling::RateBudget;
use crate::{
    AssetClass, Granularity, InstrumentId, Record, SessionCalendar, SourceId, Symbol, TimeWindow,
    UtcDateTime,
};

/// Failure returned by the next historical call, ahead of any generated data.
pub type ScriptedFailure = FetchError;

/// Deterministic offline source with fault injection.
///
/// Prices are a pure function of `(seed, symbol, slot)`, so two fetches of the
/// same window return identical payloads.
pub struct SimulatedSource {
    id: SourceId,
    asset_classes: Vec<AssetClass>,
    budget: RateBudget,
    seed: u64,
    base_price: f64,
    price_bias: f64,
    fixed_close: Option<f64>,
    calendar: SessionCalendar,
    missing: BTreeSet<UtcDateTime>,
    spikes: BTreeMap<UtcDateTime, f64>,
    unknown_symbols: HashSet<Symbol>,
    report_partial: bool,
    latency: Duration,
    tick_spacing: Duration,
    failures: Mutex<VecDeque<ScriptedFailure>>,
    calls: AtomicUsize,
    realtime: RealtimeScript,
}

struct RealtimeScript {
    granularity: Granularity,
    start: UtcDateTime,
    interval: Duration,
    skipped: BTreeSet<u64>,
    delayed: BTreeSet<u64>,
    disconnect_after: Option<u64>,
    cursor: Arc<AtomicU64>,
}

pub struct SimulatedSourceBuilder {
    source: SimulatedSource,
}

impl SimulatedSource {
    pub fn builder(id: SourceId) -> SimulatedSourceBuilder {
        SimulatedSourceBuilder {
            source: Self {
                id,
                asset_classes: AssetClass::ALL.to_vec(),
                budget: RateBudget::new(RateLimitInfo {
                    requests_per_window: 10_000,
                    window: Duration::from_secs(1),
                    max_concurrency: 16,
                }),
                seed: 7,
                base_price: 100.0,
                price_bias: 1.0,
                fixed_close: None,
                calendar: SessionCalendar::Continuous,
                missing: BTreeSet::new(),
                spikes: BTreeMap::new(),
                unknown_symbols: HashSet::new(),
                report_partial: false,
                latency: Duration::ZERO,
                tick_spacing: Duration::from_secs(60),
                failures: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                realtime: RealtimeScript {
                    granularity: Granularity::OneMinute,
                    start: UtcDateTime::now().floor_to(time::Duration::minutes(1)),
                    interval: Duration::from_secs(1),
                    skipped: BTreeSet::new(),
                    delayed: BTreeSet::new(),
                    disconnect_after: None,
                    cursor: Arc::new(AtomicU64::new(0)),
                },
            },
        }
    }

    /// Queues a failure for the next historical call.
    pub fn push_failure(&self, failure: ScriptedFailure) {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(failure);
    }

    /// Historical calls made so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_failure(&self) -> Option<ScriptedFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn close_at(&self, symbol: &Symbol, slot: i64) -> f64 {
        self.snapshot().close_at(symbol, slot)
    }

    fn generate_bar(
        &self,
        instrument: &InstrumentId,
        granularity: Granularity,
        ts: UtcDateTime,
        step: time::Duration,
    ) -> Record {
        let slot = ts.unix_nanos() / step.whole_nanoseconds().max(1) as i64;
        let mut close = self.close_at(&instrument.symbol, slot);
        if let Some(multiplier) = self.spikes.get(&ts) {
            close *= multiplier;
        }
        let open = if self.fixed_close.is_some() {
            close
        } else {
            self.close_at(&instrument.symbol, slot - 1)
        };
        let high = open.max(close);
        let low = open.min(close);
        let volume = 1_000.0 + (mix(self.seed, instrument.symbol.as_str(), slot) % 500) as f64;

        Record::bar(
            instrument.clone(),
            granularity,
            ts,
            open,
            high,
            low,
            close,
            volume,
            self.id.clone(),
        )
    }

    fn generate(
        &self,
        instrument: &InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<Vec<Record>, FetchError> {
        let Some(step) = granularity.step() else {
            let spacing = time::Duration::try_from(self.tick_spacing)
                .map_err(|err| FetchError::malformed(err.to_string()))?;
            let records = window
                .expected_slots(spacing, SessionCalendar::Continuous)
                .into_iter()
                .filter(|ts| !self.missing.contains(ts))
                .map(|ts| {
                    let slot = ts.unix_nanos() / spacing.whole_nanoseconds().max(1) as i64;
                    let price = self.close_at(&instrument.symbol, slot);
                    Record::tick(instrument.clone(), ts, price, 1.0, self.id.clone())
                })
                .collect();
            return Ok(records);
        };

        let slots = window.expected_slots(step, self.calendar);
        let expected = slots.len();
        let records: Vec<Record> = slots
            .into_iter()
            .filter(|ts| !self.missing.contains(ts))
            .map(|ts| self.generate_bar(instrument, granularity, ts, step))
            .collect();

        if self.report_partial && records.len() < expected {
            return Err(FetchError::Partial { records, expected });
        }
        Ok(records)
    }
}

impl SimulatedSourceBuilder {
    pub fn asset_classes(mut self, classes: &[AssetClass]) -> Self {
        self.source.asset_classes = classes.to_vec();
        self
    }

    pub fn rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.source.budget = RateBudget::new(info);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.source.seed = seed;
        self
    }

    pub fn base_price(mut self, price: f64) -> Self {
        self.source.base_price = price;
        self
    }

    /// Multiplies every generated price, e.g. `1.0005` for a 5bp skew.
    pub fn price_bias(mut self, bias: f64) -> Self {
        self.source.price_bias = bias;
        self
    }

    /// Flat bars at exactly `close`.
    pub fn fixed_close(mut self, close: f64) -> Self {
        self.source.fixed_close = Some(close);
        self
    }

    pub fn calendar(mut self, calendar: SessionCalendar) -> Self {
        self.source.calendar = calendar;
        self
    }

    /// Omits the record at `ts` from every historical response.
    pub fn missing(mut self, ts: UtcDateTime) -> Self {
        self.source.missing.insert(ts);
        self
    }

    /// Multiplies the close at `ts` by `multiplier`.
    pub fn spike(mut self, ts: UtcDateTime, multiplier: f64) -> Self {
        self.source.spikes.insert(ts, multiplier);
        self
    }

    pub fn unknown_symbol(mut self, symbol: Symbol) -> Self {
        self.source.unknown_symbols.insert(symbol);
        self
    }

    /// Signal short responses as [`FetchError::Partial`] instead of returning them silently.
    pub fn report_partial(mut self, enabled: bool) -> Self {
        self.source.report_partial = enabled;
        self
    }

    pub fn latency(mut self, latency: Duration) -> Self {
        self.source.latency = latency;
        self
    }

    pub fn tick_spacing(mut self, spacing: Duration) -> Self {
        self.source.tick_spacing = spacing;
        self
    }

    pub fn fail_next(self, failure: ScriptedFailure) -> Self {
        self.source.push_failure(failure);
        self
    }

    /// Realtime bars are stamped `start + n * step` and emitted every `interval`.
    pub fn realtime(mut self, granularity: Granularity, start: UtcDateTime, interval: Duration) -> Self {
        self.source.realtime.granularity = granularity;
        self.source.realtime.start = start;
        self.source.realtime.interval = interval;
        self
    }

    /// Drops the realtime emission with sequence number `index`.
    pub fn skip_realtime(mut self, index: u64) -> Self {
        self.source.realtime.skipped.insert(index);
        self
    }

    /// Holds back realtime emission `index` and delivers it right after the
    /// next one.
    pub fn delay_realtime(mut self, index: u64) -> Self {
        self.source.realtime.delayed.insert(index);
        self
    }

    /// Ends each realtime subscription after `count` emissions.
    pub fn disconnect_after(mut self, count: u64) -> Self {
        self.source.realtime.disconnect_after = Some(count);
        self
    }

    pub fn build(self) -> SimulatedSource {
        self.source
    }
}

impl SourceAdapter for SimulatedSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn asset_classes(&self) -> &[AssetClass] {
        &self.asset_classes
    }

    fn rate_limit_info(&self) -> RateLimitInfo {
        self.budget.info()
    }

    fn fetch_historical<'a>(
        &'a self,
        instrument: &'a InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
    ) -> FetchFuture<'a, Vec<Record>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.budget.try_acquire().map_err(|retry_after| {
                FetchError::rate_limited("simulated rate budget exhausted", Some(retry_after))
            })?;

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if let Some(failure) = self.next_failure() {
                return Err(failure);
            }
            if !self.validate_symbol(&instrument.symbol) {
                return Err(FetchError::permanent(format!(
                    "unknown symbol '{}'",
                    instrument.symbol
                )));
            }
            if !self.supports(instrument.asset_class) {
                return Err(FetchError::permanent(format!(
                    "asset class '{}' is not served by '{}'",
                    instrument.asset_class, self.id
                )));
            }

            self.generate(instrument, window, granularity)
        })
    }

    fn subscribe_realtime<'a>(
        &'a self,
        instruments: &'a [InstrumentId],
    ) -> FetchFuture<'a, RecordStream> {
        Box::pin(async move {
            let unknown = instruments
                .iter()
                .find(|instrument| !self.validate_symbol(&instrument.symbol));
            if let Some(instrument) = unknown {
                return Err(FetchError::permanent(format!(
                    "unknown symbol '{}'",
                    instrument.symbol
                )));
            }

            let step = self
                .realtime
                .granularity
                .step()
                .unwrap_or(time::Duration::seconds(1));
            let (sender, stream) = RecordStream::channel(256);
            let bars: Vec<(InstrumentId, SimulatedSnapshot)> = instruments
                .iter()
                .map(|instrument| (instrument.clone(), self.snapshot()))
                .collect();
            let script = RealtimeTask {
                granularity: self.realtime.granularity,
                start: self.realtime.start,
                step,
                interval: self.realtime.interval,
                skipped: self.realtime.skipped.clone(),
                delayed: self.realtime.delayed.clone(),
                disconnect_after: self.realtime.disconnect_after,
                cursor: Arc::clone(&self.realtime.cursor),
                source: self.id.clone(),
            };

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(script.interval);
                let mut emitted = 0_u64;
                let mut held: Vec<Record> = Vec::new();
                loop {
                    ticker.tick().await;
                    if script.disconnect_after.is_some_and(|limit| emitted >= limit) {
                        break;
                    }
                    let index = script.cursor.fetch_add(1, Ordering::SeqCst);
                    emitted += 1;
                    if script.skipped.contains(&index) {
                        continue;
                    }

                    let ts = script
                        .start
                        .saturating_add(script.step * i32::try_from(index).unwrap_or(i32::MAX));
                    let mut due: Vec<Record> = bars
                        .iter()
                        .map(|(instrument, snapshot)| {
                            let close = snapshot.close_at(&instrument.symbol, index as i64);
                            Record::bar(
                                instrument.clone(),
                                script.granularity,
                                ts,
                                close,
                                close,
                                close,
                                close,
                                1.0,
                                script.source.clone(),
                            )
                        })
                        .collect();
                    if script.delayed.contains(&index) {
                        held.append(&mut due);
                        continue;
                    }
                    due.append(&mut held);
                    for record in due {
                        if sender.send(Ok(record)).await.is_err() {
                            return;
                        }
                    }
                }
                for record in held {
                    if sender.send(Ok(record)).await.is_err() {
                        return;
                    }
                }
            });

            Ok(stream)
        })
    }

    fn validate_symbol(&self, symbol: &Symbol) -> bool {
        !self.unknown_symbols.contains(symbol)
    }
}

impl SimulatedSource {
    fn snapshot(&self) -> SimulatedSnapshot {
        SimulatedSnapshot {
            seed: self.seed,
            base_price: self.base_price,
            price_bias: self.price_bias,
            fixed_close: self.fixed_close,
        }
    }
}

struct RealtimeTask {
    granularity: Granularity,
    start: UtcDateTime,
    step: time::Duration,
    interval: Duration,
    skipped: BTreeSet<u64>,
    delayed: BTreeSet<u64>,
    disconnect_after: Option<u64>,
    cursor: Arc<AtomicU64>,
    source: SourceId,
}

/// Owned copy of the price model for the realtime task.
#[derive(Clone, Copy)]
struct SimulatedSnapshot {
    seed: u64,
    base_price: f64,
    price_bias: f64,
    fixed_close: Option<f64>,
}

impl SimulatedSnapshot {
    fn close_at(&self, symbol: &Symbol, slot: i64) -> f64 {
        let base = match self.fixed_close {
            Some(close) => close,
            None => {
                let noise = (mix(self.seed, symbol.as_str(), slot) % 2_000) as f64 / 2_000.0;
                self.base_price * (0.99 + 0.02 * noise)
            }
        };
        base * self.price_bias
    }
}

/// FNV-1a over the seed, symbol and slot.
fn mix(seed: u64, symbol: &str, slot: i64) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET ^ seed;
    for byte in symbol
        .bytes()
        .chain(slot.to_le_bytes())
    {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
