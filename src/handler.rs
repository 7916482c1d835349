//! Job handlers and the registry that dispatches to them.
//!
//! A handler is selected by the job's `type` string. Registration is
//! last-writer-wins, and the registry is an ordinary value owned by the
//! processor, so tests can build one full of fakes.
//!
//! ```rust
//! use jobkeeper::handler::{FnHandler, HandlerRegistry};
//! use serde_json::json;
//!
//! let registry = HandlerRegistry::new();
//! registry.register(
//!     "resize_image",
//!     FnHandler::new(|data, _ctx| async move { Ok(json!({"resized": data["path"]})) })
//!         .with_validator(|data| data.get("path").is_some()),
//! );
//!
//! assert!(registry.is_registered("resize_image"));
//! assert!(registry.resolve("missing").is_none());
//! ```

use crate::{
    Result,
    clock::Clock,
    job::{Job, JobId},
    queue::JobQueue,
};
use chrono::{DateTime, Utc};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tracing::debug;

/// Behaviour registered for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Runs one attempt. The returned value is stored as the job's `result`;
    /// an error counts as a failed attempt and may be retried.
    async fn execute(&self, data: &serde_json::Value, ctx: &JobContext) -> Result<serde_json::Value>;

    /// Checked when a job is created; `false` rejects the job before it is stored.
    fn validate(&self, _data: &serde_json::Value) -> bool {
        true
    }

    /// Advisory estimate of how long `execute` will take.
    fn estimate_duration(&self, _data: &serde_json::Value) -> Option<Duration> {
        None
    }
}

/// What a handler gets to see about the job it is running.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
}

impl JobContext {
    pub fn new(job: Job, queue: Arc<JobQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { job, queue, clock }
    }

    /// Current time on the processor's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The job as it was when this attempt started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// 1 for the first attempt.
    pub fn attempt(&self) -> u32 {
        self.job.attempts
    }

    pub fn metadata(&self) -> &serde_json::Value {
        &self.job.metadata
    }

    /// Reports progress (clamped to 0..=100). Ignored once the job has left
    /// `processing`, e.g. after a concurrent cancellation.
    pub async fn report_progress(&self, value: i64) -> Result<()> {
        self.queue.update_progress(self.job.id, value).await?;
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job.id)
            .field("job_type", &self.job.job_type)
            .field("attempt", &self.job.attempts)
            .finish()
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;

type HandlerFn = Arc<dyn Fn(serde_json::Value, JobContext) -> HandlerFuture + Send + Sync>;
type ValidatorFn = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

/// Adapts an async closure into a [`JobHandler`].
#[derive(Clone)]
pub struct FnHandler {
    run: HandlerFn,
    validator: Option<ValidatorFn>,
    estimate: Option<Duration>,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(serde_json::Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |data, ctx| Box::pin(f(data, ctx))),
            validator: None,
            estimate: None,
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimate = Some(estimate);
        self
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn execute(&self, data: &serde_json::Value, ctx: &JobContext) -> Result<serde_json::Value> {
        (self.run)(data.clone(), ctx.clone()).await
    }

    fn validate(&self, data: &serde_json::Value) -> bool {
        self.validator.as_ref().is_none_or(|validate| validate(data))
    }

    fn estimate_duration(&self, _data: &serde_json::Value) -> Option<Duration> {
        self.estimate
    }
}

/// Maps job types to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in handlers from
    /// [`crate::handlers`].
    pub fn with_builtin_handlers() -> Self {
        let registry = Self::new();
        crate::handlers::register_builtin(&registry);
        registry
    }

    /// Registers `handler` for `job_type`, replacing and returning any
    /// previous registration.
    pub fn register<H>(&self, job_type: impl Into<String>, handler: H) -> Option<Arc<dyn JobHandler>>
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let previous = handlers.insert(job_type.clone(), handler);
        if previous.is_some() {
            debug!("Replaced handler for job type '{}'", job_type);
        } else {
            debug!("Registered handler for job type '{}'", job_type);
        }
        previous
    }

    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        JobkeeperError,
        job::{JobDefaults, JobOptions, JobPayload, JobStatus},
        store::MemoryStore,
    };
    use serde_json::json;

    fn context() -> (JobContext, Arc<JobQueue>) {
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
        ));
        let job = Job::new(
            JobPayload::new("echo", json!({"message": "hi"})),
            JobOptions::new(),
            &JobDefaults::default(),
            chrono::Utc::now(),
        )
        .unwrap();
        let ctx = JobContext::new(job, queue.clone(), Arc::new(crate::clock::SystemClock));
        (ctx, queue)
    }

    #[tokio::test]
    async fn test_fn_handler_executes_closure() {
        let handler = FnHandler::new(|data, ctx| async move {
            Ok(json!({"echo": data["message"], "attempt": ctx.attempt()}))
        });
        let (ctx, _) = context();

        let result = handler.execute(&json!({"message": "hi"}), &ctx).await.unwrap();
        assert_eq!(result, json!({"echo": "hi", "attempt": 0}));
        assert!(handler.validate(&json!(null)));
        assert!(handler.estimate_duration(&json!(null)).is_none());
    }

    #[tokio::test]
    async fn test_fn_handler_propagates_errors() {
        let handler =
            FnHandler::new(|_, _| async move { Err(JobkeeperError::handler("smtp unavailable")) });
        let (ctx, _) = context();

        let error = handler.execute(&json!({}), &ctx).await.unwrap_err();
        assert_eq!(error.to_string(), "Handler error: smtp unavailable");
    }

    #[test]
    fn test_validator_and_estimate() {
        let handler = FnHandler::new(|_, _| async move { Ok(json!(null)) })
            .with_validator(|data| data.get("id").is_some())
            .with_estimate(Duration::from_secs(3));

        assert!(handler.validate(&json!({"id": 1})));
        assert!(!handler.validate(&json!({})));
        assert_eq!(
            handler.estimate_duration(&json!({})),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        let first = registry.register(
            "echo",
            FnHandler::new(|_, _| async move { Ok(json!(1)) }),
        );
        assert!(first.is_none());

        let replaced = registry.register(
            "echo",
            FnHandler::new(|_, _| async move { Ok(json!(2)) })
                .with_validator(|_| false),
        );
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);

        let handler = registry.resolve("echo").unwrap();
        assert!(!handler.validate(&json!({})));
    }

    #[test]
    fn test_registered_types_sorted() {
        let registry = HandlerRegistry::new();
        for job_type in ["zeta", "alpha", "mid"] {
            registry.register(job_type, FnHandler::new(|_, _| async move { Ok(json!(null)) }));
        }
        assert_eq!(registry.registered_types(), vec!["alpha", "mid", "zeta"]);
        assert!(registry.is_registered("mid"));
        assert!(!registry.is_registered("beta"));
    }

    #[tokio::test]
    async fn test_report_progress_ignored_outside_processing() {
        let (ctx, queue) = context();
        queue.insert(ctx.job()).await.unwrap();

        ctx.report_progress(40).await.unwrap();
        let job = queue.get(ctx.id()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);

        queue
            .update(ctx.id(), |job| {
                job.status = JobStatus::Processing;
                Ok(true)
            })
            .await
            .unwrap();
        ctx.report_progress(140).await.unwrap();
        assert_eq!(queue.get(ctx.id()).await.unwrap().unwrap().progress, 100);
    }
}
