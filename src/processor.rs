//! The public face of the queue.
//!
//! [`JobProcessor`] owns the store, handler registry, executor and scheduler
//! and exposes the job lifecycle operations. Build one with
//! [`JobProcessor::builder`] for full control or [`JobProcessor::connect`] to
//! wire everything from a [`JobkeeperConfig`].
//!
//! ```rust
//! use jobkeeper::{JobOptions, JobPayload, JobProcessor, JobStatus, Priority};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> jobkeeper::Result<()> {
//! let processor = JobProcessor::builder().build()?;
//!
//! let job = processor
//!     .create_job(
//!         JobPayload::new(
//!             "email_notification",
//!             json!({"to": "ops@example.com", "subject": "Deploy", "body": "Done"}),
//!         ),
//!         JobOptions::new().with_priority(Priority::HIGH),
//!     )
//!     .await?;
//!
//! processor.tick().await?;
//! processor.wait_for_idle().await;
//!
//! let job = processor.get_job(job.id).await?.unwrap();
//! assert_eq!(job.status, JobStatus::Completed);
//! # Ok(())
//! # }
//! ```

use crate::{
    JobkeeperError, Result,
    clock::{Clock, SystemClock},
    config::{JobkeeperConfig, ProcessorConfig, StoreBackend},
    executor::Executor,
    handler::{HandlerRegistry, JobHandler},
    job::{Job, JobDefaults, JobFilter, JobId, JobOptions, JobPayload, JobStatus, JobUpdate},
    queue::JobQueue,
    scheduler::{Scheduler, SchedulerSettings, SchedulerUpdate},
    stats::{JobStats, StatisticsCollector},
    store::{KeyValueStore, MemoryStore},
};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

#[cfg(feature = "metrics")]
use crate::metrics::PrometheusMetricsCollector;

/// Snapshot of the scheduler's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorStatus {
    pub is_running: bool,
    pub in_flight_count: usize,
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
    pub registered_types: Vec<String>,
}

pub struct JobProcessorBuilder {
    config: ProcessorConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    registry: Option<Arc<HandlerRegistry>>,
    clock: Arc<dyn Clock>,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl Default for JobProcessorBuilder {
    fn default() -> Self {
        Self {
            config: ProcessorConfig::default(),
            store: None,
            registry: None,
            clock: Arc::new(SystemClock),
            stats_collector: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }
}

impl JobProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Backing store. Defaults to a [`MemoryStore`] on the builder's clock.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handler registry. Defaults to one holding the built-in handlers.
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.config.max_concurrent_jobs = max_concurrent_jobs;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<JobProcessor> {
        self.config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::with_clock(Arc::clone(&self.clock))));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(HandlerRegistry::with_builtin_handlers()));
        let queue = Arc::new(JobQueue::new(store, self.config.job_ttl));

        let mut executor = Executor::new(
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&self.clock),
            self.config.backoff.clone(),
        );
        if let Some(stats_collector) = &self.stats_collector {
            executor = executor.with_stats_collector(Arc::clone(stats_collector));
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            executor = executor.with_metrics(Arc::clone(metrics));
        }
        let executor = Arc::new(executor);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&executor),
            Arc::clone(&self.clock),
            self.config.scheduler_settings(),
        ));

        Ok(JobProcessor {
            queue,
            registry,
            executor,
            scheduler,
            clock: self.clock,
            defaults: self.config.job_defaults(),
            stats_collector: self.stats_collector,
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        })
    }
}

pub struct JobProcessor {
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    executor: Arc<Executor>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    defaults: JobDefaults,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl JobProcessor {
    pub fn builder() -> JobProcessorBuilder {
        JobProcessorBuilder::new()
    }

    /// Builds a processor from a full configuration, connecting to the
    /// configured store.
    pub async fn connect(config: &JobkeeperConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => connect_redis(config).await?,
        };

        #[allow(unused_mut)]
        let mut builder = Self::builder()
            .config(config.processor.clone())
            .store(store);

        #[cfg(feature = "metrics")]
        if config.metrics.enabled {
            builder = builder.metrics(Arc::new(PrometheusMetricsCollector::new(&config.metrics)?));
        }

        builder.build()
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn stats_collector(&self) -> Option<&Arc<dyn StatisticsCollector>> {
        self.stats_collector.as_ref()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<PrometheusMetricsCollector>> {
        self.metrics.as_ref()
    }

    /// Registers `handler` for `job_type`; a later registration replaces it.
    pub fn register_handler<H>(&self, job_type: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.registry.register(job_type, handler);
    }

    /// Validates and stores a new pending job.
    ///
    /// If a handler is registered for the type, its `validate` must accept the
    /// payload or the job is rejected with [`JobkeeperError::InvalidPayload`]
    /// and nothing is stored. A job with no registered handler is accepted
    /// and fails when it runs.
    pub async fn create_job(&self, payload: JobPayload, options: JobOptions) -> Result<Job> {
        if let Some(handler) = self.registry.resolve(&payload.job_type) {
            if !handler.validate(&payload.data) {
                return Err(JobkeeperError::InvalidPayload {
                    job_type: payload.job_type,
                    message: "payload rejected by handler validation".to_string(),
                });
            }
        }

        let job = Job::new(payload, options, &self.defaults, self.clock.now())?;
        self.queue.insert(&job).await?;
        info!(
            "Created job {} ({}) with priority {}",
            job.id, job.job_type, job.priority
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.queue.get(id).await
    }

    /// Merges `update` into the stored job, moving its index entry when the
    /// status, priority or schedule changes.
    pub async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Job> {
        self.queue
            .update(id, |job| {
                update.apply(job);
                Ok(true)
            })
            .await
    }

    /// Jobs matching `filter`, newest first, paged by `offset`/`limit`.
    ///
    /// Without a status this walks every status×priority bucket, so it costs
    /// O(statuses × priorities) bucket reads plus one read per indexed job.
    pub async fn get_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let candidates = match filter.status {
            Some(status) => self.queue.jobs_with_status(status).await?,
            None => self.queue.all_jobs().await?,
        };

        let mut jobs: Vec<Job> = candidates
            .into_iter()
            .filter(|job| job.matches(filter))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        Ok(jobs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Job counts by status.
    pub async fn get_job_stats(&self) -> Result<JobStats> {
        let mut stats = JobStats::default();
        for status in JobStatus::ALL {
            let count = self.queue.jobs_with_status(status).await?.len();
            stats.add(status, count as u64);
        }

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.update_job_counts(&stats);
        }
        Ok(stats)
    }

    /// Re-queues a failed job for immediate execution with a fresh retry
    /// budget.
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let now = self.clock.now();
        let job = self
            .queue
            .update(id, |job| {
                if job.status != JobStatus::Failed {
                    return Err(invalid_state(job, "retry"));
                }
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.error = None;
                job.result = None;
                job.progress = 0;
                job.started_at = None;
                job.completed_at = None;
                job.scheduled_at = now.max(job.created_at);
                Ok(true)
            })
            .await?;
        info!("Job {} re-queued for retry", id);
        Ok(job)
    }

    /// Marks a job cancelled. A job that is executing keeps running, but its
    /// outcome is discarded.
    pub async fn cancel_job(&self, id: JobId) -> Result<Job> {
        let now = self.clock.now();
        let job = self
            .queue
            .update(id, |job| {
                if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
                    return Err(invalid_state(job, "cancel"));
                }
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                Ok(true)
            })
            .await?;
        info!("Job {} cancelled", id);
        Ok(job)
    }

    /// Removes a job and its index entry. Returns whether anything was removed;
    /// deleting an unknown id is not an error.
    pub async fn delete_job(&self, id: JobId) -> Result<bool> {
        let removed = self.queue.remove(id).await?.is_some();
        if removed {
            debug!("Deleted job {}", id);
        }
        Ok(removed)
    }

    /// Sets progress (clamped to 0..=100) on a processing job; ignored in
    /// any other status.
    pub async fn update_job_progress(&self, id: JobId, value: i64) -> Result<Job> {
        self.queue.update_progress(id, value).await
    }

    /// The advisory duration estimate of the job's handler, if any.
    pub fn estimated_duration(&self, job: &Job) -> Option<Duration> {
        self.registry
            .resolve(&job.job_type)
            .and_then(|handler| handler.estimate_duration(&job.data))
    }

    /// Starts the poll loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Stops the poll loop; executing jobs run to completion. Returns `false`
    /// if it was not running.
    pub async fn stop(&self) -> bool {
        self.scheduler.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn configure(&self, update: SchedulerUpdate) -> Result<SchedulerSettings> {
        self.scheduler.configure(update)
    }

    pub fn processor_status(&self) -> ProcessorStatus {
        let settings = self.scheduler.settings();
        ProcessorStatus {
            is_running: self.scheduler.is_running(),
            in_flight_count: self.executor.in_flight().len(),
            max_concurrent_jobs: settings.max_concurrent_jobs,
            poll_interval: settings.poll_interval,
            registered_types: self.registry.registered_types(),
        }
    }

    /// Runs one scheduling pass now, independent of the poll loop.
    pub async fn tick(&self) -> Result<usize> {
        self.scheduler.tick().await
    }

    /// Resolves once no job is executing.
    pub async fn wait_for_idle(&self) {
        self.executor.in_flight().wait_for_idle().await
    }

    /// Stops the poll loop and waits for executing jobs to finish.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.wait_for_idle().await;
        info!("Job processor shut down");
    }
}

fn invalid_state(job: &Job, operation: &'static str) -> JobkeeperError {
    JobkeeperError::InvalidState {
        id: job.id.to_string(),
        status: job.status,
        operation,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &JobkeeperConfig) -> Result<Arc<dyn KeyValueStore>> {
    let url = config
        .store
        .url
        .as_deref()
        .ok_or_else(|| JobkeeperError::Config("store.url is required for the redis backend".to_string()))?;
    let store = crate::store::RedisStore::connect(url)
        .await?
        .with_key_prefix(config.store.key_prefix.clone());
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &JobkeeperConfig) -> Result<Arc<dyn KeyValueStore>> {
    Err(JobkeeperError::Config(
        "the redis backend requires building with the `redis` feature".to_string(),
    ))
}
