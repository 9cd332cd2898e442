use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::adapters::{FetchError, FetchFuture, RateLimitInfo, RecordStream, SourceAdapter};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, HttpResponse};
use crate::throttling::RateBudget;
use crate::{AssetClass, Granularity, InstrumentId, Record, SourceId, TimeWindow, UtcDateTime};

/// Settings for a JSON-over-HTTP bar provider.
///
/// The provider answers `GET {base_url}/v1/bars?symbol=&exchange=&granularity=&start=&end=`
/// with `{"bars": [{"t": "...Z", "o": .., "h": .., "l": .., "c": .., "v": ..}], "expected_count": n}`.
/// Tick rows carry `p` and `s` instead of OHLCV.
#[derive(Debug, Clone)]
pub struct RestSourceConfig {
    pub id: SourceId,
    pub base_url: String,
    pub asset_classes: Vec<AssetClass>,
    pub rate_limit: RateLimitInfo,
    pub auth: HttpAuth,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub realtime_granularity: Granularity,
}

#[derive(Clone)]
struct RestRequester {
    client: Arc<dyn HttpClient>,
    config: Arc<RestSourceConfig>,
}

/// HTTP-backed adapter; realtime data is produced by polling the latest bar.
pub struct RestSource {
    requester: RestRequester,
    budget: RateBudget,
}

impl RestSource {
    pub fn new(config: RestSourceConfig, client: Arc<dyn HttpClient>) -> Self {
        let budget = RateBudget::new(config.rate_limit);
        Self {
            requester: RestRequester {
                client,
                config: Arc::new(config),
            },
            budget,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BarsPayload {
    bars: Vec<BarRow>,
    #[serde(default)]
    expected_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct BarRow {
    t: String,
    o: Option<f64>,
    h: Option<f64>,
    l: Option<f64>,
    c: Option<f64>,
    v: Option<f64>,
    p: Option<f64>,
    s: Option<f64>,
}

impl RestRequester {
    fn url(&self, instrument: &InstrumentId, window: TimeWindow, granularity: Granularity) -> String {
        format!(
            "{}/v1/bars?symbol={}&exchange={}&granularity={}&start={}&end={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(instrument.symbol.as_str()),
            urlencoding::encode(&instrument.exchange),
            granularity,
            urlencoding::encode(&window.start().format_rfc3339()),
            urlencoding::encode(&window.end().format_rfc3339()),
        )
    }

    async fn fetch(
        &self,
        instrument: &InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<Vec<Record>, FetchError> {
        let request = HttpRequest::get(self.url(instrument, window, granularity))
            .with_auth(&self.config.auth)
            .with_timeout(self.config.request_timeout);

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| FetchError::transient(err.message()))?;

        classify_status(&response)?;
        self.parse(instrument, granularity, &response.body)
    }

    fn parse(
        &self,
        instrument: &InstrumentId,
        granularity: Granularity,
        body: &str,
    ) -> Result<Vec<Record>, FetchError> {
        let payload: BarsPayload = serde_json::from_str(body)
            .map_err(|err| FetchError::malformed(format!("invalid bars payload: {err}")))?;

        let mut records = payload
            .bars
            .into_iter()
            .map(|row| self.standardize(instrument, granularity, row))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| record.ts);

        match payload.expected_count {
            Some(expected) if records.len() < expected => {
                Err(FetchError::Partial { records, expected })
            }
            _ => Ok(records),
        }
    }

    fn standardize(
        &self,
        instrument: &InstrumentId,
        granularity: Granularity,
        row: BarRow,
    ) -> Result<Record, FetchError> {
        let ts = UtcDateTime::parse(&row.t)
            .map_err(|err| FetchError::malformed(format!("bad timestamp: {err}")))?;
        let source = self.config.id.clone();

        if granularity == Granularity::Tick {
            return match (row.p, row.s) {
                (Some(price), Some(size)) => {
                    Ok(Record::tick(instrument.clone(), ts, price, size, source))
                }
                _ => Err(FetchError::malformed(format!("tick row at {ts} lacks p/s"))),
            };
        }

        match (row.o, row.h, row.l, row.c, row.v) {
            (Some(open), Some(high), Some(low), Some(close), Some(volume)) => Ok(Record::bar(
                instrument.clone(),
                granularity,
                ts,
                open,
                high,
                low,
                close,
                volume,
                source,
            )),
            _ => Err(FetchError::malformed(format!("bar row at {ts} lacks OHLCV"))),
        }
    }
}

fn classify_status(response: &HttpResponse) -> Result<(), FetchError> {
    if response.is_success() {
        return Ok(());
    }

    let status = response.status;
    match status {
        429 => {
            let retry_after = response
                .header("retry-after")
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(FetchError::rate_limited(
                format!("provider returned {status}"),
                retry_after,
            ))
        }
        400 | 401 | 403 | 404 | 422 => Err(FetchError::permanent(format!(
            "provider rejected request with {status}"
        ))),
        _ => Err(FetchError::transient(format!("provider returned {status}"))),
    }
}

impl SourceAdapter for RestSource {
    fn id(&self) -> &SourceId {
        &self.requester.config.id
    }

    fn asset_classes(&self) -> &[AssetClass] {
        &self.requester.config.asset_classes
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
            let _permit = self.budget.try_acquire().map_err(|retry_after| {
                FetchError::rate_limited("local rate budget exhausted", Some(retry_after))
            })?;
            self.requester.fetch(instrument, window, granularity).await
        })
    }

    fn subscribe_realtime<'a>(
        &'a self,
        instruments: &'a [InstrumentId],
    ) -> FetchFuture<'a, RecordStream> {
        Box::pin(async move {
            let requester = self.requester.clone();
            let budget = self.budget.clone();
            let instruments = instruments.to_vec();
            let granularity = requester.config.realtime_granularity;
            let step = granularity.step().unwrap_or(time::Duration::minutes(1));
            let (sender, stream) = RecordStream::channel(256);

            tokio::spawn(async move {
                let mut last_seen: HashMap<InstrumentId, UtcDateTime> = HashMap::new();
                let mut ticker = tokio::time::interval(requester.config.poll_interval);
                loop {
                    ticker.tick().await;
                    let end = UtcDateTime::now().floor_to(step);
                    for instrument in &instruments {
                        let start = last_seen
                            .get(instrument)
                            .map(|ts| ts.saturating_add(step))
                            .unwrap_or_else(|| end.saturating_sub(step));
                        let Ok(window) = TimeWindow::new(start, end) else {
                            continue;
                        };

                        let fetched = match budget.try_acquire() {
                            Ok(_permit) => requester.fetch(instrument, window, granularity).await,
                            Err(retry_after) => Err(FetchError::rate_limited(
                                "local rate budget exhausted",
                                Some(retry_after),
                            )),
                        };
                        let records = match fetched {
                            Ok(records) | Err(FetchError::Partial { records, .. }) => records,
                            Err(err) => {
                                let fatal = matches!(err, FetchError::Permanent { .. });
                                if sender.send(Err(err)).await.is_err() || fatal {
                                    return;
                                }
                                continue;
                            }
                        };

                        for record in records {
                            last_seen.insert(instrument.clone(), record.ts);
                            if sender.send(Ok(record)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });

            Ok(stream)
        })
    }
}
