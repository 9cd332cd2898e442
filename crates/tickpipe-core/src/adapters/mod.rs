//! Source adapter contract and reference adapters.

mod rest;
mod simulated;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{AssetClass, Granularity, InstrumentId, Record, SourceId, Symbol, TimeWindow};

pub use rest::{RestSource, RestSourceConfig};
pub use simulated::{ScriptedFailure, SimulatedSource, SimulatedSourceBuilder};

/// Boxed future returned by adapter calls.
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send + 'a>>;

/// Adapter failure taxonomy consumed by the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// Network or upstream availability problem; retry with backoff.
    #[error("transient source failure: {message}")]
    Transient { message: String },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Unknown symbol or unsupported window; deactivates the instrument for this source.
    #[error("permanent source failure: {message}")]
    Permanent { message: String },

    /// Fewer records than the window implies. The returned records are still usable.
    #[error("partial data: {} of {expected} records", records.len())]
    Partial { records: Vec<Record>, expected: usize },

    /// Payload could not be standardized.
    #[error("malformed payload: {message}")]
    Malformed { message: String },
}

/// Coarse classification of [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    Transient,
    RateLimited,
    Permanent,
    Partial,
    Malformed,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub const fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transient { .. } => FetchErrorKind::Transient,
            Self::RateLimited { .. } => FetchErrorKind::RateLimited,
            Self::Permanent { .. } => FetchErrorKind::Permanent,
            Self::Partial { .. } => FetchErrorKind::Partial,
            Self::Malformed { .. } => FetchErrorKind::Malformed,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "source.transient",
            Self::RateLimited { .. } => "source.rate_limited",
            Self::Permanent { .. } => "source.permanent",
            Self::Partial { .. } => "source.partial",
            Self::Malformed { .. } => "source.malformed",
        }
    }

    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited { .. } | Self::Partial { .. }
        )
    }

    /// Provider-suggested minimum delay before retrying.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Static rate budget advertised by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub requests_per_window: u32,
    pub window: Duration,
    pub max_concurrency: usize,
}

impl Default for RateLimitInfo {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            max_concurrency: 4,
        }
    }
}

/// Item delivered by a realtime subscription.
pub type StreamItem = Result<Record, FetchError>;

/// Unbounded realtime feed. `None` from [`RecordStream::next`] means the
/// upstream disconnected and the caller should resubscribe.
#[derive(Debug)]
pub struct RecordStream {
    receiver: mpsc::Receiver<StreamItem>,
}

impl RecordStream {
    /// Creates a connected sender/stream pair with a bounded buffer.
    pub fn channel(capacity: usize) -> (mpsc::Sender<StreamItem>, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (sender, Self { receiver })
    }

    pub async fn next(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Non-blocking poll used when draining a micro-batch.
    pub fn try_next(&mut self) -> Option<StreamItem> {
        self.receiver.try_recv().ok()
    }
}

/// Uniform fetch contract over one external data provider.
///
/// Implementations keep no persisted state between calls and enforce their
/// own rate budget, returning [`FetchError::RateLimited`] instead of waiting.
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &SourceId;

    fn asset_classes(&self) -> &[AssetClass];

    fn rate_limit_info(&self) -> RateLimitInfo;

    /// Records for `instrument` inside `window`, ordered by timestamp.
    fn fetch_historical<'a>(
        &'a self,
        instrument: &'a InstrumentId,
        window: TimeWindow,
        granularity: Granularity,
    ) -> FetchFuture<'a, Vec<Record>>;

    fn subscribe_realtime<'a>(&'a self, instruments: &'a [InstrumentId])
        -> FetchFuture<'a, RecordStream>;

    fn supports(&self, asset_class: AssetClass) -> bool {
        self.asset_classes().contains(&asset_class)
    }

    /// Cheap local check before a symbol is sent upstream.
    fn validate_symbol(&self, symbol: &Symbol) -> bool {
        !symbol.as_str().is_empty()
    }

    /// Reference metadata the source can provide for an instrument.
    fn describe(&self, instrument: &InstrumentId) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(String::from("source"), self.id().to_string());
        metadata.insert(
            String::from("asset_class"),
            instrument.asset_class.to_string(),
        );
        metadata.insert(String::from("exchange"), instrument.exchange.clone());
        metadata
    }
}
