use crate::{
    clock::{Clock, SystemClock},
    job::{ErrorCode, Job, JobId, JobStatus},
    priority::Priority,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

/// Current job counts by status, as returned by
/// [`crate::JobProcessor::get_job_stats`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|status| self.count(*status)).sum()
    }
}

impl<'a> FromIterator<&'a Job> for JobStats {
    fn from_iter<I: IntoIterator<Item = &'a Job>>(jobs: I) -> Self {
        let mut stats = JobStats::default();
        for job in jobs {
            stats.record(job.status);
        }
        stats
    }
}

/// Execution statistics over a time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Attempts that started in the window
    pub started: u64,
    /// Attempts that finished successfully
    pub completed: u64,
    /// Failed attempts that were re-queued
    pub retried: u64,
    /// Jobs that failed terminally
    pub failed: u64,
    /// Attempts cut off by their timeout (also counted as retried or failed)
    pub timed_out: u64,
    /// Outcomes discarded because the job was cancelled or deleted meanwhile
    pub superseded: u64,
    pub avg_processing_time_ms: f64,
    pub min_processing_time_ms: u64,
    pub max_processing_time_ms: u64,
    /// Finished attempts per minute
    pub throughput_per_minute: f64,
    /// (retried + failed) / finished attempts
    pub error_rate: f64,
    /// Finished attempts by priority
    pub by_priority: BTreeMap<Priority, u64>,
    pub time_window: Duration,
    pub calculated_at: DateTime<Utc>,
}

impl JobStatistics {
    fn empty(window: Duration, calculated_at: DateTime<Utc>) -> Self {
        Self {
            started: 0,
            completed: 0,
            retried: 0,
            failed: 0,
            timed_out: 0,
            superseded: 0,
            avg_processing_time_ms: 0.0,
            min_processing_time_ms: 0,
            max_processing_time_ms: 0,
            throughput_per_minute: 0.0,
            error_rate: 0.0,
            by_priority: BTreeMap::new(),
            time_window: window,
            calculated_at,
        }
    }

    /// Attempts with a recorded outcome.
    pub fn finished(&self) -> u64 {
        self.completed + self.retried + self.failed
    }
}

impl Default for JobStatistics {
    fn default() -> Self {
        Self::empty(Duration::from_secs(60), Utc::now())
    }
}

/// Something that happened to a job while it was being executed.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub event_type: JobEventType,
    pub priority: Priority,
    pub processing_time_ms: Option<u64>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: &Job, event_type: JobEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            event_type,
            priority: job.priority,
            processing_time_ms: None,
            error_code: None,
            error_message: None,
            timestamp,
        }
    }

    pub fn with_processing_time(mut self, elapsed: Duration) -> Self {
        self.processing_time_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEventType {
    Started,
    Completed,
    Retried,
    Failed,
    TimedOut,
    Superseded,
}

/// Trait for collecting and storing job statistics
#[async_trait::async_trait]
pub trait StatisticsCollector: Send + Sync {
    /// Record a job processing event
    async fn record_event(&self, event: JobEvent) -> crate::Result<()>;

    /// Statistics for one job type over a time window
    async fn get_type_statistics(
        &self,
        job_type: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics>;

    /// Statistics for every job type seen in the window
    async fn get_all_statistics(
        &self,
        window: Duration,
    ) -> crate::Result<HashMap<String, JobStatistics>>;

    /// Statistics across all job types
    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics>;

    /// Drop events older than `older_than`, returning how many were removed
    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64>;
}

/// Configuration for statistics collection
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum number of events to keep in memory
    pub max_events: usize,
    /// Maximum age of events to keep
    pub max_event_age: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_events: 100_000,
            max_event_age: Duration::from_secs(3600),
        }
    }
}

/// In-memory statistics collector with time-windowed data
pub struct InMemoryStatsCollector {
    events: Arc<RwLock<Vec<JobEvent>>>,
    config: StatsConfig,
    clock: Arc<dyn Clock>,
}

impl InMemoryStatsCollector {
    pub fn new(config: StatsConfig) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new_default() -> Self {
        Self::new(StatsConfig::default())
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_count(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn cutoff(&self, age: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn events_in_window(&self, window: Duration) -> Vec<JobEvent> {
        let cutoff = self.cutoff(window);
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    fn calculate_statistics(&self, events: &[JobEvent], window: Duration) -> JobStatistics {
        let mut stats = JobStatistics::empty(window, self.clock.now());
        let mut processing_times = Vec::new();

        for event in events {
            match event.event_type {
                JobEventType::Started => stats.started += 1,
                JobEventType::Completed => stats.completed += 1,
                JobEventType::Retried => stats.retried += 1,
                JobEventType::Failed => stats.failed += 1,
                JobEventType::TimedOut => stats.timed_out += 1,
                JobEventType::Superseded => stats.superseded += 1,
            }
            if matches!(
                event.event_type,
                JobEventType::Completed | JobEventType::Retried | JobEventType::Failed
            ) {
                *stats.by_priority.entry(event.priority).or_insert(0) += 1;
                if let Some(elapsed) = event.processing_time_ms {
                    processing_times.push(elapsed);
                }
            }
        }

        if let (Some(min), Some(max)) = (
            processing_times.iter().min().copied(),
            processing_times.iter().max().copied(),
        ) {
            let sum: u64 = processing_times.iter().sum();
            stats.avg_processing_time_ms = sum as f64 / processing_times.len() as f64;
            stats.min_processing_time_ms = min;
            stats.max_processing_time_ms = max;
        }

        let finished = stats.finished();
        if finished > 0 {
            stats.error_rate = (stats.retried + stats.failed) as f64 / finished as f64;
        }
        if window.as_secs() > 0 {
            stats.throughput_per_minute = finished as f64 * 60.0 / window.as_secs() as f64;
        }

        stats
    }

    /// Drops events older than `max_event_age` and trims to `max_events`.
    pub fn cleanup_old_events(&self) -> usize {
        let cutoff = self.cutoff(self.config.max_event_age);
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }
        original_len - events.len()
    }
}

impl Default for InMemoryStatsCollector {
    fn default() -> Self {
        Self::new_default()
    }
}

#[async_trait::async_trait]
impl StatisticsCollector for InMemoryStatsCollector {
    async fn record_event(&self, event: JobEvent) -> crate::Result<()> {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        events.push(event);

        if events.len() > self.config.max_events {
            let excess = events.len() - self.config.max_events;
            events.drain(0..excess);
        }

        Ok(())
    }

    async fn get_type_statistics(
        &self,
        job_type: &str,
        window: Duration,
    ) -> crate::Result<JobStatistics> {
        let events: Vec<JobEvent> = self
            .events_in_window(window)
            .into_iter()
            .filter(|event| event.job_type == job_type)
            .collect();
        Ok(self.calculate_statistics(&events, window))
    }

    async fn get_all_statistics(
        &self,
        window: Duration,
    ) -> crate::Result<HashMap<String, JobStatistics>> {
        let mut by_type: HashMap<String, Vec<JobEvent>> = HashMap::new();
        for event in self.events_in_window(window) {
            by_type.entry(event.job_type.clone()).or_default().push(event);
        }

        Ok(by_type
            .into_iter()
            .map(|(job_type, events)| (job_type, self.calculate_statistics(&events, window)))
            .collect())
    }

    async fn get_system_statistics(&self, window: Duration) -> crate::Result<JobStatistics> {
        let events = self.events_in_window(window);
        Ok(self.calculate_statistics(&events, window))
    }

    async fn cleanup_old_statistics(&self, older_than: Duration) -> crate::Result<u64> {
        let cutoff = self.cutoff(older_than);
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let original_len = events.len();
        events.retain(|event| event.timestamp >= cutoff);
        Ok((original_len - events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::MockClock,
        job::{JobDefaults, JobOptions, JobPayload},
    };
    use serde_json::json;

    fn job(job_type: &str, priority: Priority) -> Job {
        Job::new(
            JobPayload::new(job_type, json!({})),
            JobOptions::new().with_priority(priority),
            &JobDefaults::default(),
            Utc::now(),
        )
        .unwrap()
    }

    fn collector(clock: &MockClock) -> InMemoryStatsCollector {
        InMemoryStatsCollector::new_default().with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn test_job_stats_counts() {
        let mut completed = job("email_notification", Priority::NORMAL);
        completed.status = JobStatus::Completed;
        let pending = job("email_notification", Priority::NORMAL);
        let other_pending = job("report_generation", Priority::LOW);

        let stats: JobStats = [&completed, &pending, &other_pending].into_iter().collect();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.count(JobStatus::Failed), 0);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_job_stats_serialization() {
        let mut stats = JobStats::default();
        stats.add(JobStatus::Processing, 4);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(
            json,
            json!({"pending": 0, "processing": 4, "completed": 0, "failed": 0, "cancelled": 0})
        );
    }

    #[tokio::test]
    async fn test_in_memory_stats_collector() {
        let clock = MockClock::new();
        let collector = collector(&clock);
        let job = job("email_notification", Priority::NORMAL);

        collector
            .record_event(JobEvent::new(&job, JobEventType::Started, clock.now()))
            .await
            .unwrap();
        collector
            .record_event(
                JobEvent::new(&job, JobEventType::Completed, clock.now())
                    .with_processing_time(Duration::from_millis(1000)),
            )
            .await
            .unwrap();

        let stats = collector
            .get_type_statistics("email_notification", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats.started, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.finished(), 1);
        assert_eq!(stats.avg_processing_time_ms, 1000.0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.throughput_per_minute, 1.0);
    }

    #[tokio::test]
    async fn test_statistics_calculation_with_multiple_events() {
        let clock = MockClock::new();
        let collector = collector(&clock);
        let normal = job("data_processing", Priority::NORMAL);
        let high = job("data_processing", Priority::HIGH);

        let events = vec![
            JobEvent::new(&normal, JobEventType::Completed, clock.now())
                .with_processing_time(Duration::from_millis(1500)),
            JobEvent::new(&high, JobEventType::Completed, clock.now())
                .with_processing_time(Duration::from_millis(500)),
            JobEvent::new(&normal, JobEventType::TimedOut, clock.now()).with_error("Job timeout"),
            JobEvent::new(&normal, JobEventType::Retried, clock.now()).with_error("Job timeout"),
            JobEvent::new(&high, JobEventType::Failed, clock.now()).with_error("boom"),
            JobEvent::new(&high, JobEventType::Superseded, clock.now()),
        ];
        for event in events {
            collector.record_event(event).await.unwrap();
        }

        let stats = collector
            .get_system_statistics(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.avg_processing_time_ms, 1000.0);
        assert_eq!(stats.min_processing_time_ms, 500);
        assert_eq!(stats.max_processing_time_ms, 1500);
        assert_eq!(stats.error_rate, 0.5);
        assert_eq!(stats.by_priority.get(&Priority::HIGH), Some(&2));
        assert_eq!(stats.by_priority.get(&Priority::NORMAL), Some(&2));
    }

    #[tokio::test]
    async fn test_statistics_grouped_by_type() {
        let clock = MockClock::new();
        let collector = collector(&clock);

        for job_type in ["email_notification", "email_notification", "report_generation"] {
            let job = job(job_type, Priority::NORMAL);
            collector
                .record_event(JobEvent::new(&job, JobEventType::Completed, clock.now()))
                .await
                .unwrap();
        }

        let all = collector
            .get_all_statistics(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["email_notification"].completed, 2);
        assert_eq!(all["report_generation"].completed, 1);
    }

    #[tokio::test]
    async fn test_window_excludes_old_events() {
        let clock = MockClock::new();
        let collector = collector(&clock);
        let job = job("email_notification", Priority::NORMAL);

        collector
            .record_event(JobEvent::new(&job, JobEventType::Completed, clock.now()))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(120));
        collector
            .record_event(JobEvent::new(&job, JobEventType::Failed, clock.now()))
            .await
            .unwrap();

        let stats = collector
            .get_system_statistics(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed, 1);

        let removed = collector
            .cleanup_old_statistics(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(collector.event_count(), 1);
    }

    #[tokio::test]
    async fn test_event_cleanup_respects_limits() {
        let clock = MockClock::new();
        let collector = InMemoryStatsCollector::new(StatsConfig {
            max_events: 2,
            max_event_age: Duration::from_secs(1),
        })
        .with_clock(Arc::new(clock.clone()));
        let job = job("email_notification", Priority::NORMAL);

        for _ in 0..3 {
            collector
                .record_event(JobEvent::new(&job, JobEventType::Started, clock.now()))
                .await
                .unwrap();
        }
        assert_eq!(collector.event_count(), 2);

        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(collector.cleanup_old_events(), 2);
        assert_eq!(collector.event_count(), 0);
    }
}
