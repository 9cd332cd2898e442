//! # Tickpipe Core
//!
//! Market data ingestion, quality and scheduling pipeline.
//!
//! ## Overview
//!
//! - **Source adapters** fetch historical windows and realtime streams behind
//!   one contract, each enforcing its own rate budget
//! - **Quality engine** turns raw adapter output into a validated batch with a
//!   PASS/WARN/REJECT verdict and detected gaps
//! - **Data manager** persists accepted batches, resolves cross-source
//!   conflicts and keeps the gap ledger and watermarks
//! - **Scheduler** owns fetch jobs: priority dispatch over bounded per-source
//!   worker pools, retries with backoff, circuit breaking and gap-close jobs
//! - **Realtime feed** micro-batches live records through the same path
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Source adapter contract, simulated and REST adapters |
//! | [`circuit_breaker`] | Per-source circuit breaker |
//! | [`config`] | TOML pipeline configuration |
//! | [`domain`] | Instruments, timestamps, windows, granularities, records |
//! | [`ledger`] | Coverage, gap and watermark bookkeeping |
//! | [`manager`] | Write path and conflict resolution |
//! | [`pipeline`] | Startup wiring |
//! | [`quality`] | Batch validation and verdicts |
//! | [`realtime`] | Live feed supervision |
//! | [`registry`] | Adapter registry and asset-class routes |
//! | [`scheduler`] | Fetch job state machine and dispatch |
//! | [`storage`] | Storage seams, in-memory and DuckDB implementations |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tickpipe_core::config::PipelineConfig;
//! use tickpipe_core::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::load("tickpipe.toml".as_ref())?;
//!     let pipeline = Pipeline::from_config(config).await?;
//!     pipeline.start().await?;
//!     pipeline.backfill_configured().await?;
//!     let report = pipeline.run_until_idle().await;
//!     println!("{} jobs succeeded", report.succeeded);
//!     Ok(())
//! }
//! ```
//!
//! ## Security
//!
//! - API keys are read from environment variables named in config, never logged
//! - Input validation on all domain types

pub mod adapters;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod ledger;
pub mod manager;
pub mod pipeline;
pub mod quality;
pub mod realtime;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod throttling;

// Adapter contract
pub use adapters::{FetchError, FetchErrorKind, RateLimitInfo, RecordStream, SourceAdapter};

// Domain models
pub use domain::{
    AssetClass, DataKind, Granularity, Instrument, InstrumentId, Record, RecordFields,
    SessionCalendar, Symbol, TimeWindow, UtcDateTime,
};

// Error types
pub use error::{CoreError, ValidationError};

// Pipeline components
pub use manager::{DataManager, ManagerError, SourceRanking, WriteReport};
pub use pipeline::{Pipeline, PipelineReport, PipelineStorage};
pub use quality::{Outcome, QualityEngine, QualityVerdict, ValidatedBatch};
pub use registry::AdapterRegistry;
pub use scheduler::{FetchJob, JobId, JobState, JobSummary, PriorityClass, RunReport, Scheduler};

// Source identifiers
pub use source::SourceId;
