//! Process configuration, read once from TOML at start and immutable after.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tickpipe_warehouse::WarehouseConfig;

use crate::adapters::RateLimitInfo;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::http_client::HttpAuth;
use crate::quality::QualityConfig;
use crate::realtime::RealtimeConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::{AssetClass, Granularity, InstrumentId, SourceId, ValidationError};

pub const HOME_ENV: &str = "TICKPIPE_HOME";
pub const DB_PATH_ENV: &str = "TICKPIPE_DB_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("source '{source_id}' needs credentials in environment variable '{variable}'")]
    MissingCredential { source_id: SourceId, variable: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "config.io",
            Self::Parse(_) => "config.parse",
            Self::Invalid(_) => "config.invalid",
            Self::MissingCredential { .. } => "config.missing_credential",
            Self::Validation(_) => "config.validation",
        }
    }
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Duckdb,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub home: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub max_pool_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Duckdb,
            home: None,
            db_path: None,
            max_pool_size: 4,
        }
    }
}

impl StorageConfig {
    pub fn warehouse_config(&self) -> WarehouseConfig {
        let mut config = match &self.home {
            Some(home) => WarehouseConfig::in_home(home.clone()),
            None => WarehouseConfig::default(),
        };
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        config.max_pool_size = self.max_pool_size;
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_ms: u64,
    pub max_concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let info = RateLimitInfo::default();
        Self {
            requests_per_window: info.requests_per_window,
            window_ms: u64::try_from(info.window.as_millis()).unwrap_or(u64::MAX),
            max_concurrency: info.max_concurrency,
        }
    }
}

impl RateLimitConfig {
    pub fn info(&self) -> RateLimitInfo {
        RateLimitInfo {
            requests_per_window: self.requests_per_window,
            window: Duration::from_millis(self.window_ms),
            max_concurrency: self.max_concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    #[serde(default = "all_asset_classes")]
    pub asset_classes: Vec<AssetClass>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(flatten)]
    pub settings: SourceSettings,
}

fn all_asset_classes() -> Vec<AssetClass> {
    AssetClass::ALL.to_vec()
}

/// Adapter-specific settings selected by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSettings {
    Simulated(SimulatedSettings),
    Rest(RestSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedSettings {
    pub seed: u64,
    pub base_price: f64,
    pub price_bias: f64,
    pub latency_ms: u64,
    pub realtime_granularity: Granularity,
    pub realtime_interval_ms: u64,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            seed: 7,
            base_price: 100.0,
            price_bias: 1.0,
            latency_ms: 0,
            realtime_granularity: Granularity::OneMinute,
            realtime_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestSettings {
    pub base_url: String,
    /// Environment variable holding the API key. Never logged.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Send the key in this header instead of `Authorization: Bearer`.
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_realtime_granularity")]
    pub realtime_granularity: Granularity,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_realtime_granularity() -> Granularity {
    Granularity::OneMinute
}

impl RestSettings {
    /// Resolves credentials through `lookup` (normally the process environment).
    pub fn auth<F>(&self, source_id: &SourceId, lookup: F) -> Result<HttpAuth, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(variable) = &self.api_key_env else {
            return Ok(HttpAuth::None);
        };
        let key = lookup(variable)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential {
                source_id: source_id.clone(),
                variable: variable.clone(),
            })?;
        Ok(match &self.api_key_header {
            Some(name) => HttpAuth::Header {
                name: name.clone(),
                value: key,
            },
            None => HttpAuth::BearerToken(key),
        })
    }
}

/// Instrument kept fresh by periodic refresh and, optionally, the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub exchange: String,
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    /// History fetched on first refresh when no watermark exists yet.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default)]
    pub realtime: bool,
}

fn default_granularity() -> Granularity {
    Granularity::OneDay
}

fn default_lookback_days() -> u32 {
    30
}

impl InstrumentConfig {
    pub fn instrument_id(&self) -> Result<InstrumentId, ValidationError> {
        InstrumentId::new(&self.symbol, self.asset_class, &self.exchange)
    }

    pub fn lookback(&self) -> time::Duration {
        time::Duration::days(i64::from(self.lookback_days))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub quality: QualityConfig,
    pub realtime: RealtimeConfig,
    /// Conflict-resolution ranking, highest first. Unlisted sources rank last.
    pub source_priority: Vec<SourceId>,
    pub sources: Vec<SourceConfig>,
    /// Asset class (`equity`, `crypto`, ...) to sources in preference order.
    pub routes: BTreeMap<String, Vec<SourceId>>,
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            quality: QualityConfig::default(),
            realtime: RealtimeConfig::default(),
            source_priority: Vec::new(),
            sources: Vec::new(),
            routes: BTreeMap::new(),
            instruments: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Reads `path`, applies environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|name| env::var(name).ok());
        config.validate()?;
        tracing::debug!(path = %path.display(), sources = config.sources.len(), "config loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `TICKPIPE_HOME` and `TICKPIPE_DB_PATH` as resolved by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(home) = lookup(HOME_ENV).filter(|value| !value.is_empty()) {
            self.storage.home = Some(PathBuf::from(home));
        }
        if let Some(db_path) = lookup(DB_PATH_ENV).filter(|value| !value.is_empty()) {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::invalid("at least one [[sources]] entry is required"));
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if !ids.insert(&source.id) {
                return Err(ConfigError::invalid(format!("source '{}' is defined twice", source.id)));
            }
            if source.asset_classes.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "source '{}' must serve at least one asset class",
                    source.id
                )));
            }
            let limit = source.rate_limit;
            if limit.requests_per_window == 0 || limit.window_ms == 0 || limit.max_concurrency == 0 {
                return Err(ConfigError::invalid(format!(
                    "source '{}' rate limit values must be greater than zero",
                    source.id
                )));
            }
            if let SourceSettings::Rest(rest) = &source.settings {
                let url = rest.base_url.trim();
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::invalid(format!(
                        "source '{}' base_url must be an http(s) URL",
                        source.id
                    )));
                }
            }
        }

        for (class, sources) in &self.routes {
            let asset_class = class.parse::<AssetClass>()?;
            for source_id in sources {
                let Some(source) = self.source(source_id) else {
                    return Err(ConfigError::invalid(format!(
                        "route '{class}' names unknown source '{source_id}'"
                    )));
                };
                if !source.asset_classes.contains(&asset_class) {
                    return Err(ConfigError::invalid(format!(
                        "source '{source_id}' does not serve asset class '{class}'"
                    )));
                }
            }
        }

        for source_id in &self.source_priority {
            if self.source(source_id).is_none() {
                return Err(ConfigError::invalid(format!(
                    "source_priority names unknown source '{source_id}'"
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter must be within [0, 1]"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid("retry.base_delay_ms exceeds retry.max_delay_ms"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold must be at least 1"));
        }
        if !(self.quality.z_threshold.is_finite() && self.quality.z_threshold > 0.0) {
            return Err(ConfigError::invalid("quality.z_threshold must be positive"));
        }
        let tolerance = self.quality.reconciliation_tolerance;
        if tolerance.is_nan() || tolerance < 0.0 {
            return Err(ConfigError::invalid(
                "quality.reconciliation_tolerance must be non-negative",
            ));
        }
        if self.scheduler.job_timeout.is_zero() {
            return Err(ConfigError::invalid("scheduler.job_timeout_ms must be greater than zero"));
        }
        if self.realtime.batch_size == 0 {
            return Err(ConfigError::invalid("realtime.batch_size must be at least 1"));
        }

        for instrument in &self.instruments {
            let id = instrument.instrument_id()?;
            let served = self
                .sources
                .iter()
                .any(|source| source.asset_classes.contains(&id.asset_class));
            if !served {
                return Err(ConfigError::invalid(format!(
                    "no source serves instrument {id}"
                )));
            }
        }

        Ok(())
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceConfig> {
        self.sources.iter().find(|source| &source.id == id)
    }

    /// Routes with parsed asset classes.
    pub fn parsed_routes(&self) -> Result<Vec<(AssetClass, Vec<SourceId>)>, ConfigError> {
        self.routes
            .iter()
            .map(|(class, sources)| Ok((class.parse::<AssetClass>()?, sources.clone())))
            .collect()
    }
}

/// Starter configuration written by `tickpipe init`.
pub const SAMPLE_CONFIG: &str = r#"# tickpipe pipeline configuration

source_priority = ["sim-primary", "sim-secondary"]

[storage]
backend = "duckdb"
max_pool_size = 4

[scheduler]
job_timeout_ms = 30000
refresh_interval_ms = 300000
idle_poll_ms = 250

[retry]
max_attempts = 5
base_delay_ms = 500
max_delay_ms = 60000
jitter = 0.5

[breaker]
failure_threshold = 5
cooldown_ms = 30000

[quality]
z_threshold = 4.0
lookback = 20
min_samples = 5
reconciliation_tolerance = 0.0001

[realtime]
enabled = false
gap_policy = "auto_backfill"
batch_size = 64
flush_interval_ms = 1000

[[sources]]
id = "sim-primary"
kind = "simulated"
asset_classes = ["equity", "etf", "crypto", "forex", "future", "index"]
seed = 7

[sources.rate_limit]
requests_per_window = 120
window_ms = 60000
max_concurrency = 4

[[sources]]
id = "sim-secondary"
kind = "simulated"
asset_classes = ["equity", "crypto"]
seed = 7
price_bias = 1.0005

[routes]
equity = ["sim-primary", "sim-secondary"]
crypto = ["sim-primary", "sim-secondary"]

[[instruments]]
symbol = "AAPL"
asset_class = "equity"
exchange = "XNAS"
granularity = "1d"
lookback_days = 30
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses_and_validates() {
        let config = PipelineConfig::from_toml_str(SAMPLE_CONFIG).expect("parse sample");
        config.validate().expect("sample is valid");

        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.breaker.cooldown, Duration::from_secs(30));
        assert_eq!(config.sources[0].rate_limit.info().max_concurrency, 4);
        assert!(matches!(
            &config.sources[1].settings,
            SourceSettings::Simulated(settings) if (settings.price_bias - 1.0005).abs() < f64::EPSILON
        ));
        assert_eq!(
            config.parsed_routes().expect("routes")[0].0,
            AssetClass::Crypto
        );
    }

    #[test]
    fn rejects_routes_to_unknown_sources() {
        let raw = r#"
[[sources]]
id = "sim"
kind = "simulated"

[routes]
equity = ["missing"]
"#;
        let config = PipelineConfig::from_toml_str(raw).expect("parse");
        let err = config.validate().expect_err("unknown route target");
        assert!(err.to_string().contains("unknown source 'missing'"));
    }

    #[test]
    fn rest_sources_require_http_urls() {
        let raw = r#"
[[sources]]
id = "vendor"
kind = "rest"
base_url = "ftp://example.test"
"#;
        let config = PipelineConfig::from_toml_str(raw).expect("parse");
        assert_eq!(config.validate().expect_err("bad url").code(), "config.invalid");
    }

    #[test]
    fn environment_overrides_storage_paths() {
        let mut config = PipelineConfig::from_toml_str(SAMPLE_CONFIG).expect("parse");
        config.apply_overrides(|name| match name {
            HOME_ENV => Some(String::from("/tmp/tickpipe-home")),
            DB_PATH_ENV => Some(String::from("/tmp/custom.duckdb")),
            _ => None,
        });

        let warehouse = config.storage.warehouse_config();
        assert_eq!(warehouse.home, PathBuf::from("/tmp/tickpipe-home"));
        assert_eq!(warehouse.db_path, PathBuf::from("/tmp/custom.duckdb"));
    }

    #[test]
    fn api_key_comes_from_named_variable() {
        let settings = RestSettings {
            base_url: String::from("https://example.test"),
            api_key_env: Some(String::from("VENDOR_KEY")),
            api_key_header: Some(String::from("X-Api-Key")),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            realtime_granularity: default_realtime_granularity(),
        };
        let id = SourceId::parse("vendor").expect("id");

        let auth = settings
            .auth(&id, |name| (name == "VENDOR_KEY").then(|| String::from("secret")))
            .expect("auth");
        assert_eq!(
            auth,
            HttpAuth::Header {
                name: String::from("X-Api-Key"),
                value: String::from("secret"),
            }
        );

        let missing = settings.auth(&id, |_| None).expect_err("missing key");
        assert!(matches!(missing, ConfigError::MissingCredential { .. }));
    }
}
