//! Contract every source adapter must honor, run against the simulated
//! adapter and the REST adapter over a stub transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickpipe_core::adapters::{RestSource, RestSourceConfig, SimulatedSource};
use tickpipe_core::http_client::{
    HttpAuth, HttpClient, HttpFuture, HttpRequest, HttpResponse,
};
use tickpipe_core::{
    AssetClass, FetchErrorKind, Granularity, InstrumentId, RateLimitInfo, SourceAdapter,
    SourceId, Symbol, TimeWindow, UtcDateTime,
};

struct AdapterCase {
    name: &'static str,
    adapter: Arc<dyn SourceAdapter>,
}

/// Serves ten daily bars for any symbol except ZZZZ, newest first.
struct BarServer {
    requests: Mutex<Vec<String>>,
}

impl BarServer {
    fn body() -> String {
        let rows: Vec<String> = (1..=10)
            .rev()
            .map(|day| {
                format!(
                    r#"{{"t":"2024-01-{day:02}T00:00:00Z","o":100.0,"h":101.0,"l":99.0,"c":100.5,"v":1000}}"#
                )
            })
            .collect();
        format!(r#"{{"bars":[{}]}}"#, rows.join(","))
    }
}

impl HttpClient for BarServer {
    fn execute<'a>(&'a self, request: HttpRequest) -> HttpFuture<'a> {
        self.requests
            .lock()
            .expect("lock")
            .push(request.url.clone());
        let response = if request.url.contains("symbol=ZZZZ") {
            HttpResponse::new(404, r#"{"error":"unknown symbol"}"#)
        } else {
            HttpResponse::new(200, Self::body())
        };
        Box::pin(async move { Ok(response) })
    }
}

fn limit(requests_per_window: u32) -> RateLimitInfo {
    RateLimitInfo {
        requests_per_window,
        window: Duration::from_secs(60),
        max_concurrency: 4,
    }
}

fn adapter_cases(rate_limit: RateLimitInfo) -> Vec<AdapterCase> {
    let simulated = SimulatedSource::builder(SourceId::parse("sim").expect("id"))
        .asset_classes(&[AssetClass::Equity, AssetClass::Crypto])
        .rate_limit(rate_limit)
        .unknown_symbol(Symbol::parse("ZZZZ").expect("symbol"))
        .build();

    let rest = RestSource::new(
        RestSourceConfig {
            id: SourceId::parse("vendor").expect("id"),
            base_url: String::from("https://bars.example.test"),
            asset_classes: vec![AssetClass::Equity, AssetClass::Crypto],
            rate_limit,
            auth: HttpAuth::BearerToken(String::from("test-key")),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
            realtime_granularity: Granularity::OneMinute,
        },
        Arc::new(BarServer {
            requests: Mutex::new(Vec::new()),
        }),
    );

    vec![
        AdapterCase {
            name: "simulated",
            adapter: Arc::new(simulated),
        },
        AdapterCase {
            name: "rest",
            adapter: Arc::new(rest),
        },
    ]
}

fn aapl() -> InstrumentId {
    InstrumentId::new("AAPL", AssetClass::Equity, "XNAS").expect("id")
}

fn january() -> TimeWindow {
    TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-11T00:00:00Z").expect("window")
}

#[tokio::test]
async fn when_history_is_fetched_then_records_are_ordered_standardized_and_in_window() {
    for case in adapter_cases(limit(100)) {
        let records = case
            .adapter
            .fetch_historical(&aapl(), january(), Granularity::OneDay)
            .await
            .unwrap_or_else(|error| panic!("adapter '{}' fetch failed: {error}", case.name));

        assert!(!records.is_empty(), "adapter '{}': no records", case.name);
        assert!(
            records.windows(2).all(|pair| pair[0].ts < pair[1].ts),
            "adapter '{}': records must be strictly ordered",
            case.name
        );
        for record in &records {
            assert!(january().contains(record.ts), "adapter '{}': out of window", case.name);
            assert_eq!(&record.source, case.adapter.id(), "adapter '{}': source", case.name);
            assert_eq!(record.instrument, aapl(), "adapter '{}': instrument", case.name);
            assert_eq!(record.granularity, Granularity::OneDay, "adapter '{}'", case.name);
            assert!(record.validate().is_ok(), "adapter '{}': invalid record", case.name);
        }
    }
}

#[tokio::test]
async fn when_symbol_is_unknown_then_the_failure_is_permanent() {
    let zzzz = InstrumentId::new("ZZZZ", AssetClass::Equity, "XNAS").expect("id");
    for case in adapter_cases(limit(100)) {
        let error = case
            .adapter
            .fetch_historical(&zzzz, january(), Granularity::OneDay)
            .await
            .expect_err("unknown symbol must fail");

        assert_eq!(
            error.kind(),
            FetchErrorKind::Permanent,
            "adapter '{}': {error}",
            case.name
        );
        assert!(!error.is_retryable(), "adapter '{}'", case.name);
    }
}

#[tokio::test]
async fn when_rate_budget_is_spent_then_adapter_refuses_with_a_delay_instead_of_waiting() {
    for case in adapter_cases(limit(2)) {
        for _ in 0..2 {
            case.adapter
                .fetch_historical(&aapl(), january(), Granularity::OneDay)
                .await
                .unwrap_or_else(|error| panic!("adapter '{}' fetch failed: {error}", case.name));
        }

        let started = std::time::Instant::now();
        let error = case
            .adapter
            .fetch_historical(&aapl(), january(), Granularity::OneDay)
            .await
            .expect_err("budget exhausted");

        assert_eq!(error.kind(), FetchErrorKind::RateLimited, "adapter '{}'", case.name);
        assert!(error.retry_after().is_some(), "adapter '{}': retry_after", case.name);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "adapter '{}' must not block on its budget",
            case.name
        );
    }
}

#[test]
fn every_adapter_advertises_its_budget_and_asset_classes() {
    for case in adapter_cases(limit(30)) {
        let info = case.adapter.rate_limit_info();
        assert_eq!(info.requests_per_window, 30, "adapter '{}'", case.name);
        assert_eq!(info.max_concurrency, 4, "adapter '{}'", case.name);
        assert!(case.adapter.supports(AssetClass::Crypto), "adapter '{}'", case.name);
        assert!(!case.adapter.supports(AssetClass::Future), "adapter '{}'", case.name);
    }
}

#[tokio::test]
async fn when_the_same_window_is_fetched_twice_then_payloads_match() {
    for case in adapter_cases(limit(100)) {
        let first = case
            .adapter
            .fetch_historical(&aapl(), january(), Granularity::OneDay)
            .await
            .expect("first fetch");
        let second = case
            .adapter
            .fetch_historical(&aapl(), january(), Granularity::OneDay)
            .await
            .expect("second fetch");

        assert_eq!(first.len(), second.len(), "adapter '{}'", case.name);
        assert!(
            first
                .iter()
                .zip(&second)
                .all(|(left, right)| left.ts == right.ts && left.same_payload(right)),
            "adapter '{}': fetches must be deterministic",
            case.name
        );
    }
}

#[tokio::test]
async fn when_simulated_source_streams_then_records_arrive_on_the_step_grid() {
    let start = UtcDateTime::parse("2024-03-01T00:00:00Z").expect("ts");
    let adapter = SimulatedSource::builder(SourceId::parse("live").expect("id"))
        .realtime(Granularity::OneMinute, start, Duration::from_millis(10))
        .disconnect_after(3)
        .build();
    let btc = InstrumentId::new("BTC-USD", AssetClass::Crypto, "COINBASE").expect("id");

    let mut stream = adapter
        .subscribe_realtime(std::slice::from_ref(&btc))
        .await
        .expect("subscribe");
    let mut received = Vec::new();
    while let Some(item) = stream.next().await {
        received.push(item.expect("record").ts);
    }

    assert_eq!(
        received,
        vec![
            start,
            start.saturating_add(time::Duration::minutes(1)),
            start.saturating_add(time::Duration::minutes(2)),
        ]
    );
}
