//! # Jobkeeper
//!
//! An in-process background job queue and worker pool persisted in a
//! key/value store.
//!
//! ## Features
//!
//! - **Pluggable storage**: any store with `get`, `set` with TTL and `delete`;
//!   an in-memory store is built in and Redis is available behind a feature flag
//! - **Priority buckets**: jobs are indexed by status and priority (0-10) and
//!   dispatched highest priority first, FIFO within a priority
//! - **Bounded concurrency**: a poll loop dispatches up to
//!   `max_concurrent_jobs` jobs, each on its own task
//! - **Retries**: failed attempts are re-queued with exponential backoff until
//!   the job's retry budget is spent
//! - **Timeouts and cancellation**: per-job timeouts, and cancellation that
//!   never resurrects a job when its handler finishes late
//! - **Statistics and metrics**: execution events feed an in-memory statistics
//!   collector and Prometheus metrics (enabled by default)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobkeeper::{FnHandler, JobOptions, JobPayload, JobProcessor, Priority};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> jobkeeper::Result<()> {
//!     let processor = JobProcessor::builder()
//!         .max_concurrent_jobs(4)
//!         .poll_interval(Duration::from_secs(1))
//!         .build()?;
//!
//!     processor.register_handler(
//!         "thumbnail",
//!         FnHandler::new(|data, ctx| async move {
//!             ctx.report_progress(50).await?;
//!             Ok(json!({"source": data["path"], "width": 128}))
//!         }),
//!     );
//!
//!     processor
//!         .create_job(
//!             JobPayload::new("thumbnail", json!({"path": "uploads/cat.png"})),
//!             JobOptions::new().with_priority(Priority::HIGH).with_max_retries(5),
//!         )
//!         .await?;
//!
//!     processor.start();
//!     tokio::signal::ctrl_c().await?;
//!     processor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! A [`Job`] carries a `type` that selects its handler, an opaque JSON `data`
//! payload and `metadata`, a priority, a retry budget and a timeout. Its
//! status moves `pending → processing → completed`, back to `pending` for a
//! retry, or to `failed` once retries run out. Any job not yet completed can
//! be cancelled.
//!
//! ### Handlers
//!
//! A [`JobHandler`] runs one attempt and returns a JSON result. Handlers may
//! validate payloads at creation time and estimate their duration. They are
//! registered by type in a [`HandlerRegistry`] owned by the processor.
//!
//! ### Storage
//!
//! Records live under `job:<id>` with a TTL; the index keeps one bucket per
//! `(status, priority)` under `jobs:queue:<status>:<priority>`. See
//! [`queue`] for the layout and its consistency rules.
//!
//! ## Feature Flags
//!
//! - `metrics` - Enable Prometheus metrics collection (default)
//! - `redis` - Enable the Redis store

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod handlers;
pub mod job;
pub mod logging;
pub mod priority;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod store;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{JobkeeperConfig, LoggingConfig, MetricsConfig, ProcessorConfig, StoreConfig};
pub use error::JobkeeperError;
pub use executor::{InFlightGuard, InFlightSet};
pub use handler::{FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use job::{
    ErrorCode, Job, JobError, JobFilter, JobId, JobOptions, JobPayload, JobStatus, JobUpdate,
};
pub use priority::{Priority, PriorityError};
pub use processor::{JobProcessor, JobProcessorBuilder, ProcessorStatus};
pub use queue::JobQueue;
pub use retry::{BackoffPolicy, JitterType};
pub use scheduler::{SchedulerSettings, SchedulerUpdate};
pub use stats::{
    InMemoryStatsCollector, JobEvent, JobEventType, JobStatistics, JobStats, StatisticsCollector,
};
pub use store::{KeyValueStore, MemoryStore};

#[cfg(feature = "redis")]
pub use store::RedisStore;

#[cfg(feature = "metrics")]
pub use metrics::PrometheusMetricsCollector;

/// Convenient type alias for Results with [`JobkeeperError`] as the error type.
pub type Result<T> = std::result::Result<T, JobkeeperError>;
