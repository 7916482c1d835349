//! Runs one attempt of one job.
//!
//! [`Executor::dispatch`] claims the job in the [`InFlightSet`] and spawns the
//! attempt as its own task. The attempt moves the job to `processing`, runs the
//! handler under the job's timeout and writes the outcome back. The claim is
//! released by [`InFlightGuard`]'s `Drop`, so it is released however the
//! attempt ends, panics included.
//!
//! Outcome writes re-read the stored job first. If it was cancelled, deleted or
//! otherwise moved on while the handler ran, the outcome is discarded and a
//! [`JobEventType::Superseded`] event is recorded instead.

use crate::{
    JobkeeperError, Result,
    clock::Clock,
    handler::{HandlerRegistry, JobContext},
    job::{ErrorCode, Job, JobError, JobId, JobStatus},
    queue::JobQueue,
    retry::BackoffPolicy,
    stats::{JobEvent, JobEventType, StatisticsCollector},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

#[cfg(feature = "metrics")]
use crate::metrics::PrometheusMetricsCollector;

/// Message stored on a job whose attempt ran out of time.
pub const TIMEOUT_MESSAGE: &str = "Job timeout";

#[derive(Default)]
struct InFlightInner {
    ids: Mutex<HashSet<JobId>>,
    idle: Notify,
}

/// Ids of the jobs currently executing in this process.
#[derive(Clone, Default)]
pub struct InFlightSet {
    inner: Arc<InFlightInner>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`, or returns `None` if it is already executing.
    pub fn try_claim(&self, id: JobId) -> Option<InFlightGuard> {
        let mut ids = self.inner.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id) {
            return None;
        }
        Some(InFlightGuard {
            set: self.clone(),
            id,
        })
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.inner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> HashSet<JobId> {
        self.inner
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once no job is executing.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, id: JobId) {
        let now_empty = {
            let mut ids = self.inner.ids.lock().unwrap_or_else(PoisonError::into_inner);
            ids.remove(&id);
            ids.is_empty()
        };
        if now_empty {
            self.inner.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for InFlightSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.snapshot()).finish()
    }
}

/// A claim on one in-flight id, released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightSet,
    id: JobId,
}

impl InFlightGuard {
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release(self.id);
    }
}

enum Outcome {
    Succeeded(serde_json::Value),
    Failed {
        code: ErrorCode,
        message: String,
        trace: Option<String>,
    },
}

pub struct Executor {
    queue: Arc<JobQueue>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    in_flight: InFlightSet,
    stats_collector: Option<Arc<dyn StatisticsCollector>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<PrometheusMetricsCollector>>,
}

impl Executor {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            queue,
            registry,
            clock,
            backoff,
            in_flight: InFlightSet::new(),
            stats_collector: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    pub fn with_stats_collector(mut self, stats_collector: Arc<dyn StatisticsCollector>) -> Self {
        self.stats_collector = Some(stats_collector);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<PrometheusMetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Claims `id` and runs one attempt on a new task. Returns `false`
    /// without spawning if the job is already executing.
    pub fn dispatch(self: &Arc<Self>, id: JobId) -> bool {
        let Some(guard) = self.in_flight.try_claim(id) else {
            debug!("Job {} is already in flight, skipping", id);
            return false;
        };
        self.publish_in_flight();

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = executor.execute(guard.id()).await {
                error!("Job {} attempt aborted: {}", guard.id(), e);
            }
            drop(guard);
            executor.publish_in_flight();
        });
        true
    }

    /// Runs one attempt of `id` on the current task. Returns the stored job
    /// afterwards, or `None` if the job was missing or not eligible to start.
    pub async fn execute(&self, id: JobId) -> Result<Option<Job>> {
        let Some(job) = self.begin(id).await? else {
            return Ok(None);
        };
        let started_at = job.started_at.unwrap_or_else(|| self.clock.now());
        self.record_event(JobEvent::new(&job, JobEventType::Started, started_at))
            .await;

        let started = tokio::time::Instant::now();
        let outcome = self.run_handler(&job).await;
        let elapsed = started.elapsed();

        let finished = match outcome {
            Outcome::Succeeded(value) => self.complete(&job, value, elapsed).await?,
            Outcome::Failed {
                code,
                message,
                trace,
            } => self.fail(&job, code, message, trace, elapsed).await?,
        };
        Ok(finished)
    }

    /// Moves a due pending job to `processing` and counts the attempt.
    async fn begin(&self, id: JobId) -> Result<Option<Job>> {
        let now = self.clock.now();
        let mut claimed = false;

        let result = self
            .queue
            .update(id, |job| {
                if !job.is_eligible(now) {
                    return Ok(false);
                }
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.attempts += 1;
                job.progress = 0;
                claimed = true;
                Ok(true)
            })
            .await;

        match result {
            Ok(job) if claimed => {
                debug!(
                    "Processing job {} ({}), attempt {}",
                    job.id, job.job_type, job.attempts
                );
                Ok(Some(job))
            }
            Ok(job) => {
                debug!("Job {} is {} and not due, skipping", job.id, job.status);
                Ok(None)
            }
            Err(JobkeeperError::JobNotFound { .. }) => {
                debug!("Job {} disappeared before it started", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_handler(&self, job: &Job) -> Outcome {
        let Some(handler) = self.registry.resolve(&job.job_type) else {
            let error = JobkeeperError::NoHandler {
                job_type: job.job_type.clone(),
            };
            return Outcome::Failed {
                code: ErrorCode::NoHandler,
                message: error.to_string(),
                trace: None,
            };
        };

        let ctx = JobContext::new(
            job.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
        );
        let data = job.data.clone();
        // a panicking handler must not take the attempt down with it
        let mut task = tokio::spawn(async move { handler.execute(&data, &ctx).await });

        let joined = if job.timeout_seconds == 0 {
            (&mut task).await
        } else {
            match tokio::time::timeout(job.timeout(), &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    warn!("Job {} timed out after {:?}", job.id, job.timeout());
                    return Outcome::Failed {
                        code: ErrorCode::Timeout,
                        message: TIMEOUT_MESSAGE.to_string(),
                        trace: None,
                    };
                }
            }
        };

        match joined {
            Ok(Ok(value)) => Outcome::Succeeded(value),
            Ok(Err(e)) => Outcome::Failed {
                code: ErrorCode::HandlerError,
                message: match &e {
                    JobkeeperError::Handler { message } => message.clone(),
                    other => other.to_string(),
                },
                trace: Some(format!("{:?}", e)),
            },
            Err(join_error) => Outcome::Failed {
                code: ErrorCode::HandlerError,
                message: format!("Handler panicked: {}", join_error),
                trace: None,
            },
        }
    }

    async fn complete(
        &self,
        job: &Job,
        value: serde_json::Value,
        elapsed: Duration,
    ) -> Result<Option<Job>> {
        let now = self.clock.now();
        let attempt = job.attempts;
        let mut applied = false;

        let stored = self
            .finish(job, |stored| {
                if stored.status != JobStatus::Processing || stored.attempts != attempt {
                    return Ok(false);
                }
                stored.status = JobStatus::Completed;
                stored.completed_at = Some(now);
                stored.result = Some(value);
                stored.progress = 100;
                stored.error = None;
                applied = true;
                Ok(true)
            })
            .await?;

        if applied {
            debug!("Job {} completed in {:?}", job.id, elapsed);
            self.record_event(
                JobEvent::new(job, JobEventType::Completed, now).with_processing_time(elapsed),
            )
            .await;
        } else {
            self.superseded(job, stored.as_ref(), now).await;
        }
        Ok(stored)
    }

    async fn fail(
        &self,
        job: &Job,
        code: ErrorCode,
        message: String,
        trace: Option<String>,
        elapsed: Duration,
    ) -> Result<Option<Job>> {
        let now = self.clock.now();
        let attempt = job.attempts;
        let retry = code != ErrorCode::NoHandler && job.can_retry();
        let retry_at = chrono::Duration::from_std(self.backoff.delay(attempt))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC);

        if code == ErrorCode::Timeout {
            self.record_event(
                JobEvent::new(job, JobEventType::TimedOut, now)
                    .with_processing_time(elapsed)
                    .with_error_code(code)
                    .with_error(message.clone()),
            )
            .await;
        }

        let mut applied = false;
        let event_message = message.clone();
        let stored = self
            .finish(job, |stored| {
                if stored.status != JobStatus::Processing || stored.attempts != attempt {
                    return Ok(false);
                }
                if retry {
                    stored.status = JobStatus::Pending;
                    stored.scheduled_at = retry_at;
                    stored.error = Some(JobError {
                        code,
                        message,
                        trace,
                    });
                } else {
                    stored.status = JobStatus::Failed;
                    stored.completed_at = Some(now);
                    let code = match code {
                        ErrorCode::NoHandler => ErrorCode::NoHandler,
                        _ => ErrorCode::MaxRetriesExceeded,
                    };
                    stored.error = Some(JobError {
                        code,
                        message,
                        trace,
                    });
                }
                applied = true;
                Ok(true)
            })
            .await?;

        if !applied {
            self.superseded(job, stored.as_ref(), now).await;
            return Ok(stored);
        }

        let event = if retry {
            debug!(
                "Job {} failed attempt {}: {}; retrying at {}",
                job.id, attempt, event_message, retry_at
            );
            JobEvent::new(job, JobEventType::Retried, now).with_error_code(code)
        } else {
            warn!(
                "Job {} failed after {} attempt(s): {}",
                job.id, attempt, event_message
            );
            let code = stored
                .as_ref()
                .and_then(|stored| stored.error.as_ref())
                .map_or(code, |error| error.code);
            JobEvent::new(job, JobEventType::Failed, now).with_error_code(code)
        };
        self.record_event(
            event
                .with_processing_time(elapsed)
                .with_error(event_message),
        )
        .await;
        Ok(stored)
    }

    /// Applies an outcome write, treating a deleted job as superseded.
    async fn finish<F>(&self, job: &Job, f: F) -> Result<Option<Job>>
    where
        F: FnOnce(&mut Job) -> Result<bool>,
    {
        match self.queue.update(job.id, f).await {
            Ok(stored) => Ok(Some(stored)),
            Err(JobkeeperError::JobNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn superseded(&self, job: &Job, stored: Option<&Job>, now: chrono::DateTime<chrono::Utc>) {
        match stored {
            Some(stored) => warn!(
                "Discarding outcome of job {}: it is now {}",
                job.id, stored.status
            ),
            None => warn!("Discarding outcome of job {}: it was deleted", job.id),
        }
        self.record_event(JobEvent::new(job, JobEventType::Superseded, now))
            .await;
    }

    async fn record_event(&self, event: JobEvent) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_job_event(&event);
        }

        if let Some(stats_collector) = &self.stats_collector {
            if let Err(e) = stats_collector.record_event(event).await {
                warn!("Failed to record statistics event: {}", e);
            }
        }
    }

    fn publish_in_flight(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.set_in_flight(self.in_flight.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MockClock,
        handler::FnHandler,
        job::{JobDefaults, JobOptions, JobPayload},
        priority::Priority,
        stats::InMemoryStatsCollector,
        store::MemoryStore,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        executor: Arc<Executor>,
        queue: Arc<JobQueue>,
        registry: Arc<HandlerRegistry>,
        clock: MockClock,
        stats: Arc<InMemoryStatsCollector>,
    }

    fn harness() -> Harness {
        let clock = MockClock::new();
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let queue = Arc::new(JobQueue::new(Arc::new(store), Duration::from_secs(86_400)));
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(InMemoryStatsCollector::new_default().with_clock(Arc::new(clock.clone())));
        let executor = Arc::new(
            Executor::new(
                queue.clone(),
                registry.clone(),
                Arc::new(clock.clone()),
                BackoffPolicy::default(),
            )
            .with_stats_collector(stats.clone()),
        );
        Harness {
            executor,
            queue,
            registry,
            clock,
            stats,
        }
    }

    async fn enqueue(h: &Harness, job_type: &str, options: JobOptions) -> Job {
        let job = Job::new(
            JobPayload::new(job_type, json!({"n": 1})),
            options,
            &JobDefaults::default(),
            h.clock.now(),
        )
        .unwrap();
        h.queue.insert(&job).await.unwrap();
        job
    }

    #[test]
    fn test_in_flight_claims_are_exclusive() {
        let set = InFlightSet::new();
        let id = uuid::Uuid::new_v4();

        let guard = set.try_claim(id).unwrap();
        assert!(set.try_claim(id).is_none());
        assert!(set.contains(id));
        assert_eq!(set.len(), 1);

        drop(guard);
        assert!(set.is_empty());
        assert!(set.try_claim(id).is_some());
    }

    #[tokio::test]
    async fn test_wait_for_idle() {
        let set = InFlightSet::new();
        set.wait_for_idle().await;

        let guard = set.try_claim(uuid::Uuid::new_v4()).unwrap();
        let waiter = {
            let set = set.clone();
            tokio::spawn(async move { set.wait_for_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let h = harness();
        h.registry.register(
            "echo",
            FnHandler::new(|data, ctx| async move {
                ctx.report_progress(30).await?;
                Ok(json!({"echo": data["n"]}))
            }),
        );
        let job = enqueue(&h, "echo", JobOptions::new()).await;

        let done = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 1);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({"echo": 1})));
        assert!(done.started_at.is_some());
        assert_eq!(done.completed_at, Some(h.clock.now()));
        assert!(done.error.is_none());

        let stats = h.stats.get_system_statistics(Duration::from_secs(60)).await.unwrap();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let h = harness();
        h.registry.register(
            "flaky",
            FnHandler::new(|_, _| async move { Err(JobkeeperError::handler("connection reset")) }),
        );
        let job = enqueue(&h, "flaky", JobOptions::new().with_max_retries(2)).await;

        let retried = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.scheduled_at, h.clock.now() + chrono::Duration::seconds(2));
        let error = retried.error.unwrap();
        assert_eq!(error.code, ErrorCode::HandlerError);
        assert_eq!(error.message, "connection reset");

        // not due yet
        assert!(h.executor.execute(job.id).await.unwrap().is_none());

        h.clock.advance(chrono::Duration::seconds(2));
        let second = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert_eq!(second.scheduled_at, h.clock.now() + chrono::Duration::seconds(4));
        assert_eq!(
            h.queue.bucket(JobStatus::Pending, Priority::default()).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unrepresentable_backoff_saturates_retry_at() {
        let h = harness();
        let executor = Executor::new(
            h.queue.clone(),
            h.registry.clone(),
            Arc::new(h.clock.clone()),
            BackoffPolicy::exponential(Duration::from_secs(1), 1e300),
        );
        h.registry.register(
            "flaky",
            FnHandler::new(|_, _| async move { Err(JobkeeperError::handler("try later")) }),
        );
        let job = enqueue(&h, "flaky", JobOptions::new().with_max_retries(2)).await;

        let retried = executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.scheduled_at, chrono::DateTime::<chrono::Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_job() {
        let h = harness();
        h.registry.register(
            "broken",
            FnHandler::new(|_, _| async move { Err(JobkeeperError::handler("always broken")) }),
        );
        let job = enqueue(&h, "broken", JobOptions::new().with_max_retries(0)).await;

        let failed = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.completed_at, Some(h.clock.now()));
        let error = failed.error.unwrap();
        assert_eq!(error.code, ErrorCode::MaxRetriesExceeded);
        assert_eq!(error.message, "always broken");
        assert!(
            h.queue
                .bucket(JobStatus::Pending, Priority::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails_without_retry() {
        let h = harness();
        let job = enqueue(&h, "unregistered", JobOptions::new().with_max_retries(5)).await;

        let failed = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.error.unwrap().code, ErrorCode::NoHandler);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_retryable_failure() {
        let h = harness();
        h.registry.register(
            "slow",
            FnHandler::new(|_, _| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            }),
        );
        let job = enqueue(
            &h,
            "slow",
            JobOptions::new().with_timeout(Duration::from_secs(1)),
        )
        .await;

        let timed_out = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(timed_out.status, JobStatus::Pending);
        let error = timed_out.error.unwrap();
        assert_eq!(error.code, ErrorCode::Timeout);
        assert_eq!(error.message, TIMEOUT_MESSAGE);

        let stats = h.stats.get_system_statistics(Duration::from_secs(60)).await.unwrap();
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.retried, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let h = harness();
        h.registry.register(
            "panics",
            FnHandler::new(|data, _| async move {
                if data.is_object() {
                    panic!("handler bug");
                }
                Ok(json!(null))
            }),
        );
        let job = enqueue(&h, "panics", JobOptions::new()).await;

        let retried = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(retried.error.unwrap().message.starts_with("Handler panicked"));
    }

    #[tokio::test]
    async fn test_cancel_during_processing_is_not_overwritten() {
        let h = harness();
        let queue = h.queue.clone();
        h.registry.register(
            "cancelled_midway",
            FnHandler::new(move |_, ctx| {
                let queue = queue.clone();
                async move {
                    queue
                        .update(ctx.id(), |job| {
                            job.status = JobStatus::Cancelled;
                            Ok(true)
                        })
                        .await?;
                    Ok(json!("done"))
                }
            }),
        );
        let job = enqueue(&h, "cancelled_midway", JobOptions::new()).await;

        let stored = h.executor.execute(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.result.is_none());

        let stats = h.stats.get_system_statistics(Duration::from_secs(60)).await.unwrap();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_deleted_during_processing() {
        let h = harness();
        let queue = h.queue.clone();
        h.registry.register(
            "deleted_midway",
            FnHandler::new(move |_, ctx| {
                let queue = queue.clone();
                async move {
                    queue.remove(ctx.id()).await?;
                    Err(JobkeeperError::handler("too late"))
                }
            }),
        );
        let job = enqueue(&h, "deleted_midway", JobOptions::new()).await;

        assert!(h.executor.execute(job.id).await.unwrap().is_none());
        assert!(h.queue.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_skips_jobs_already_in_flight() {
        let h = harness();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        h.registry.register(
            "counted",
            FnHandler::new(move |_, _| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        );
        let job = enqueue(&h, "counted", JobOptions::new()).await;

        assert!(h.executor.dispatch(job.id));
        assert!(!h.executor.dispatch(job.id));
        h.executor.in_flight().wait_for_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.queue.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
