//! Startup wiring: builds every component once from a [`PipelineConfig`]
//! and shares it through `Arc`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tickpipe_warehouse::Warehouse;
use tokio::sync::watch;

use crate::adapters::{RestSource, RestSourceConfig, SimulatedSource, SourceAdapter};
use crate::config::{PipelineConfig, SourceConfig, SourceSettings, StorageBackend};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::ledger::Ledger;
use crate::manager::{DataManager, SourceRanking};
use crate::quality::QualityEngine;
use crate::realtime::{FeedStats, RealtimeFeed};
use crate::registry::AdapterRegistry;
use crate::scheduler::{
    InstrumentGates, JobId, PriorityClass, RefreshTarget, RunReport, Scheduler,
};
use crate::storage::{JobStore, LedgerStore, MemoryStore, StorageGateway, WarehouseStore};
use crate::{CoreError, Granularity, InstrumentId, TimeWindow, UtcDateTime};

/// The three storage seams, usually backed by one store.
#[derive(Clone)]
pub struct PipelineStorage {
    pub records: Arc<dyn StorageGateway>,
    pub jobs: Arc<dyn JobStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub warehouse: Option<WarehouseStore>,
}

impl PipelineStorage {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            records: store.clone(),
            jobs: store.clone(),
            ledger: store,
            warehouse: None,
        }
    }

    pub fn warehouse(store: WarehouseStore) -> Self {
        let shared = Arc::new(store.clone());
        Self {
            records: shared.clone(),
            jobs: shared.clone(),
            ledger: shared,
            warehouse: Some(store),
        }
    }

    /// Opens the configured backend. DuckDB work runs on the blocking pool.
    pub async fn open(config: &PipelineConfig) -> Result<Self, CoreError> {
        match config.storage.backend {
            StorageBackend::Memory => Ok(Self::memory(Arc::new(MemoryStore::new()))),
            StorageBackend::Duckdb => {
                let warehouse_config = config.storage.warehouse_config();
                let warehouse = tokio::task::spawn_blocking(move || Warehouse::open(warehouse_config))
                    .await
                    .map_err(|error| crate::storage::StorageError::Unavailable {
                        message: error.to_string(),
                    })??;
                Ok(Self::warehouse(WarehouseStore::new(warehouse)))
            }
        }
    }
}

/// What `Pipeline::run` did before shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub jobs: RunReport,
    pub live: Option<FeedStats>,
}

/// Fully wired ingestion pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<AdapterRegistry>,
    storage: PipelineStorage,
    manager: Arc<DataManager>,
    engine: Arc<QualityEngine>,
    scheduler: Arc<Scheduler>,
    feed: Option<Arc<RealtimeFeed>>,
}

impl Pipeline {
    /// Builds adapters and storage from `config`, reading API keys from the
    /// process environment.
    pub async fn from_config(config: PipelineConfig) -> Result<Self, CoreError> {
        let client: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());
        let registry = build_registry(&config, client, |name| std::env::var(name).ok())?;
        let storage = PipelineStorage::open(&config).await?;
        Self::assemble(config, registry, storage)
    }

    /// Wires already-built adapters and storage.
    pub fn assemble(
        config: PipelineConfig,
        registry: AdapterRegistry,
        storage: PipelineStorage,
    ) -> Result<Self, CoreError> {
        let registry = Arc::new(registry);
        let ledger = Arc::new(Ledger::new());
        let manager = Arc::new(DataManager::new(
            storage.records.clone(),
            ledger,
            storage.ledger.clone(),
            SourceRanking::new(config.source_priority.clone()),
        ));
        let engine = Arc::new(QualityEngine::new(config.quality.clone()));

        let mut refresh = Vec::with_capacity(config.instruments.len());
        let mut live = Vec::new();
        for instrument in &config.instruments {
            let id = instrument.instrument_id()?;
            refresh.push(RefreshTarget {
                instrument: id.clone(),
                granularity: instrument.granularity,
                lookback: instrument.lookback(),
            });
            if instrument.realtime {
                live.push(id);
            }
        }

        let gates = Arc::new(InstrumentGates::new());
        let scheduler = Arc::new(
            Scheduler::builder(
                registry.clone(),
                manager.clone(),
                engine.clone(),
                storage.jobs.clone(),
            )
            .config(config.scheduler)
            .retry(config.retry)
            .breaker(config.breaker)
            .gates(gates)
            .refresh_targets(refresh)
            .build(),
        );

        let feed = (config.realtime.enabled && !live.is_empty()).then(|| {
            Arc::new(RealtimeFeed::new(
                registry.clone(),
                manager.clone(),
                engine.clone(),
                scheduler.clone(),
                config.realtime,
                live,
            ))
        });

        tracing::info!(
            sources = registry.len(),
            instruments = config.instruments.len(),
            realtime = feed.is_some(),
            "pipeline assembled"
        );
        Ok(Self {
            config,
            registry,
            storage,
            manager,
            engine,
            scheduler,
            feed,
        })
    }

    /// Restores the gap ledger and resumes persisted jobs. Call once before
    /// running.
    pub async fn start(&self) -> Result<usize, CoreError> {
        self.manager.restore_ledger().await?;
        Ok(self.scheduler.resume().await?)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &PipelineStorage {
        &self.storage
    }

    pub fn manager(&self) -> &Arc<DataManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<QualityEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn feed(&self) -> Option<&Arc<RealtimeFeed>> {
        self.feed.as_ref()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        self.manager.ledger()
    }

    /// Queues an opportunistic backfill of `window`.
    pub async fn backfill(
        &self,
        instrument: InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
    ) -> Result<JobId, CoreError> {
        Ok(self
            .scheduler
            .enqueue(instrument, window, granularity, PriorityClass::Backfill)
            .await?)
    }

    /// Backfills every configured instrument over its lookback, ending at
    /// the current step boundary.
    pub async fn backfill_configured(&self) -> Result<Vec<JobId>, CoreError> {
        let mut jobs = Vec::new();
        for instrument in &self.config.instruments {
            let Some(step) = instrument.granularity.step() else {
                continue;
            };
            let end = UtcDateTime::now().floor_to(step);
            let start = end.saturating_sub(instrument.lookback()).floor_to(step);
            let window = TimeWindow::new(start, end)?;
            jobs.push(
                self.backfill(instrument.instrument_id()?, window, instrument.granularity)
                    .await?,
            );
        }
        Ok(jobs)
    }

    pub async fn run_until_idle(&self) -> RunReport {
        self.scheduler.run_until_idle().await
    }

    /// Runs the scheduler loop and, when enabled, the realtime feed until
    /// `shutdown` turns true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PipelineReport {
        let feed = self.feed.clone();
        let feed_shutdown = shutdown.clone();
        let live = async move {
            match feed {
                Some(feed) => Some(feed.run(feed_shutdown).await),
                None => None,
            }
        };
        let (jobs, live) = tokio::join!(self.scheduler.run_forever(shutdown), live);
        PipelineReport { jobs, live }
    }
}

/// Registers one adapter per configured source and applies the routes.
pub fn build_registry<F>(
    config: &PipelineConfig,
    client: Arc<dyn HttpClient>,
    lookup: F,
) -> Result<AdapterRegistry, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut registry = AdapterRegistry::new();
    for source in &config.sources {
        registry.register(build_adapter(source, Arc::clone(&client), &lookup)?)?;
    }
    for (asset_class, sources) in config.parsed_routes()? {
        registry.route(asset_class, sources)?;
    }
    Ok(registry)
}

fn build_adapter<F>(
    source: &SourceConfig,
    client: Arc<dyn HttpClient>,
    lookup: &F,
) -> Result<Arc<dyn SourceAdapter>, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    let adapter: Arc<dyn SourceAdapter> = match &source.settings {
        SourceSettings::Simulated(settings) => {
            let step = settings
                .realtime_granularity
                .step()
                .unwrap_or(time::Duration::minutes(1));
            Arc::new(
                SimulatedSource::builder(source.id.clone())
                    .asset_classes(&source.asset_classes)
                    .rate_limit(source.rate_limit.info())
                    .seed(settings.seed)
                    .base_price(settings.base_price)
                    .price_bias(settings.price_bias)
                    .latency(Duration::from_millis(settings.latency_ms))
                    .realtime(
                        settings.realtime_granularity,
                        UtcDateTime::now().floor_to(step),
                        Duration::from_millis(settings.realtime_interval_ms),
                    )
                    .build(),
            )
        }
        SourceSettings::Rest(settings) => {
            let auth = settings.auth(&source.id, lookup)?;
            Arc::new(RestSource::new(
                RestSourceConfig {
                    id: source.id.clone(),
                    base_url: settings.base_url.trim().to_owned(),
                    asset_classes: source.asset_classes.clone(),
                    rate_limit: source.rate_limit.info(),
                    auth,
                    request_timeout: Duration::from_millis(settings.request_timeout_ms),
                    poll_interval: Duration::from_millis(settings.poll_interval_ms),
                    realtime_granularity: settings.realtime_granularity,
                },
                client,
            ))
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SAMPLE_CONFIG;
    use crate::ledger::SeriesKey;
    use crate::AssetClass;

    fn memory_config() -> PipelineConfig {
        let mut config = PipelineConfig::from_toml_str(SAMPLE_CONFIG).expect("sample");
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn registry_follows_configured_routes() {
        let config = memory_config();
        let registry = build_registry(&config, Arc::new(ReqwestHttpClient::new()), |_| None)
            .expect("registry");

        assert_eq!(registry.len(), 2);
        let crypto: Vec<String> = registry
            .sources_for(AssetClass::Crypto)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(crypto, vec!["sim-primary", "sim-secondary"]);
    }

    #[test]
    fn rest_source_without_credential_is_refused() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [[sources]]
            id = "vendor"
            kind = "rest"
            base_url = "https://example.test"
            api_key_env = "VENDOR_KEY"
            "#,
        )
        .expect("parse");

        let err = build_registry(&config, Arc::new(ReqwestHttpClient::new()), |_| None)
            .err()
            .expect("missing key");
        assert_eq!(err.code(), "config.missing_credential");
    }

    #[tokio::test]
    async fn backfill_runs_through_quality_and_storage() {
        let pipeline = Pipeline::from_config(memory_config()).await.expect("pipeline");
        pipeline.start().await.expect("start");

        let instrument = InstrumentId::new("BTC-USD", AssetClass::Crypto, "COINBASE").expect("id");
        let window = TimeWindow::parse("2024-01-01T00:00:00Z", "2024-01-08T00:00:00Z").expect("window");
        pipeline
            .backfill(instrument.clone(), window, Granularity::OneDay)
            .await
            .expect("enqueue");

        let report = pipeline.run_until_idle().await;

        assert_eq!(report.succeeded, 1);
        let key = SeriesKey::new(instrument, Granularity::OneDay);
        let stored = pipeline.manager().resolved_range(&key, window).await.expect("range");
        assert_eq!(stored.len(), 7);
        assert_eq!(
            pipeline.ledger().watermark(&key).map(|watermark| watermark.last_confirmed),
            Some(UtcDateTime::parse("2024-01-07T00:00:00Z").expect("ts"))
        );
    }
}
