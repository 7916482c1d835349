//! The poll loop.
//!
//! While running, the scheduler wakes every `poll_interval`, works out how much
//! concurrency headroom is left and walks the pending buckets from the highest
//! priority down, handing due jobs to the [`Executor`]. Dispatch never waits for
//! a job to finish; the next tick runs on schedule.
//!
//! Settings live in a [`tokio::sync::watch`] channel so
//! [`Scheduler::configure`] takes effect on a running loop: a new
//! `poll_interval` rebuilds the timer, a new `max_concurrent_jobs` applies from
//! the next tick. Jobs already executing are never touched.

use crate::{
    JobkeeperError, Result,
    clock::Clock,
    executor::Executor,
    priority::Priority,
    queue::JobQueue,
};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerSettings {
    pub max_concurrent_jobs: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_jobs < 1 {
            return Err(JobkeeperError::Config(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(JobkeeperError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A partial change to [`SchedulerSettings`]; unset fields are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerUpdate {
    pub max_concurrent_jobs: Option<usize>,
    pub poll_interval: Option<Duration>,
}

impl SchedulerUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_jobs(mut self, max_concurrent_jobs: usize) -> Self {
        self.max_concurrent_jobs = Some(max_concurrent_jobs);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    pub fn with_poll_interval_ms(self, millis: u64) -> Self {
        self.with_poll_interval(Duration::from_millis(millis))
    }

    pub fn apply_to(&self, settings: SchedulerSettings) -> SchedulerSettings {
        SchedulerSettings {
            max_concurrent_jobs: self
                .max_concurrent_jobs
                .unwrap_or(settings.max_concurrent_jobs),
            poll_interval: self.poll_interval.unwrap_or(settings.poll_interval),
        }
    }
}

struct RunningLoop {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    executor: Arc<Executor>,
    clock: Arc<dyn Clock>,
    settings: watch::Sender<SchedulerSettings>,
    running: Mutex<Option<RunningLoop>>,
    /// Serializes ticks so headroom is computed against settled in-flight state.
    tick_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        executor: Arc<Executor>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let (settings, _) = watch::channel(settings);
        Self {
            queue,
            executor,
            clock,
            settings,
            running: Mutex::new(None),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        *self.settings.borrow()
    }

    /// Validates and applies `update`, returning the new settings.
    pub fn configure(&self, update: SchedulerUpdate) -> Result<SchedulerSettings> {
        let settings = update.apply_to(self.settings());
        settings.validate()?;
        self.settings.send_replace(settings);
        info!(
            "Scheduler configured: max_concurrent_jobs={}, poll_interval={:?}",
            settings.max_concurrent_jobs, settings.poll_interval
        );
        Ok(settings)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts the poll loop. Returns `false` if it was already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return false;
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
        *running = Some(RunningLoop { shutdown, handle });
        true
    }

    /// Stops the poll loop and waits for it to exit. Jobs already dispatched
    /// keep running. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(RunningLoop { shutdown, handle }) = running else {
            return false;
        };

        let _ = shutdown.send(());
        if let Err(e) = handle.await {
            error!("Scheduler loop ended abnormally: {}", e);
        }
        true
    }

    /// Runs one scheduling pass and returns how many jobs were dispatched.
    ///
    /// Concurrent calls run one after another, so together they never
    /// dispatch past `max_concurrent_jobs`.
    pub async fn tick(&self) -> Result<usize> {
        let _guard = self.tick_lock.lock().await;
        let settings = self.settings();
        let in_flight = self.executor.in_flight();
        let busy = in_flight.len();
        if busy >= settings.max_concurrent_jobs {
            debug!(
                "At capacity ({}/{}), skipping tick",
                busy, settings.max_concurrent_jobs
            );
            return Ok(0);
        }

        let mut headroom = settings.max_concurrent_jobs - busy;
        let now = self.clock.now();
        let mut dispatched = 0;

        for priority in Priority::descending() {
            if headroom == 0 {
                break;
            }
            let skip = in_flight.snapshot();
            for job in self.queue.eligible(priority, now, headroom, &skip).await? {
                if self.executor.dispatch(job.id) {
                    dispatched += 1;
                    headroom -= 1;
                }
            }
        }

        if dispatched > 0 {
            debug!("Dispatched {} job(s)", dispatched);
        }
        Ok(dispatched)
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut settings = self.settings.subscribe();
        let mut interval = poll_timer(settings.borrow_and_update().poll_interval);
        info!("Scheduler started, polling every {:?}", interval.period());

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler shutting down");
                    break;
                }
                changed = settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let poll_interval = settings.borrow_and_update().poll_interval;
                    if poll_interval != interval.period() {
                        debug!("Poll interval changed to {:?}, restarting timer", poll_interval);
                        interval = poll_timer(poll_interval);
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
    }
}

fn poll_timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
