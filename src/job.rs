use crate::{JobkeeperError, priority::Priority};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, time::Duration};
use uuid::Uuid;

pub type JobId = Uuid;

/// Lifecycle state of a job.
///
/// ```text
/// pending ──▶ processing ──▶ completed
///    ▲            │
///    └── retry ◀──┤
///                 └──▶ failed ──(retry_job)──▶ pending
///
/// pending | processing | failed ──(cancel_job)──▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled jobs are never picked up by the scheduler.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown job status: {}", s))
    }
}

/// Machine-readable classification of a persisted failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    HandlerError,
    Timeout,
    NoHandler,
    MaxRetriesExceeded,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::HandlerError => "HandlerError",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::NoHandler => "NoHandler",
            ErrorCode::MaxRetriesExceeded => "MaxRetriesExceeded",
        };
        f.write_str(name)
    }
}

/// The last failure recorded on a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    pub trace: Option<String>,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

/// A persisted unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub priority: Priority,
    pub delay_seconds: u64,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub tags: BTreeSet<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub result: Option<serde_json::Value>,
    pub progress: u8,
}

impl Job {
    /// Builds a new pending job from a payload, applying `options` over
    /// `defaults`. `now` is the creation instant.
    ///
    /// Fails with [`JobkeeperError::InvalidOptions`] if the delay puts
    /// `scheduled_at` beyond the representable range.
    pub fn new(
        payload: JobPayload,
        options: JobOptions,
        defaults: &JobDefaults,
        now: DateTime<Utc>,
    ) -> crate::Result<Self> {
        let delay_seconds = options.delay_seconds.unwrap_or(0);
        let scheduled_at = delay_from(now, delay_seconds).ok_or_else(|| {
            JobkeeperError::InvalidOptions {
                message: format!("delay of {} seconds is out of range", delay_seconds),
            }
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            job_type: payload.job_type,
            data: payload.data,
            metadata: payload.metadata,
            priority: options.priority.unwrap_or(defaults.priority),
            delay_seconds,
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            timeout_seconds: options
                .timeout_seconds
                .unwrap_or(defaults.timeout.as_secs()),
            tags: options.tags,
            status: JobStatus::Pending,
            attempts: 0,
            created_at: now,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
            progress: 0,
        })
    }

    /// A job is eligible for dispatch when it is pending and due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_at <= now
    }

    /// Whether a failed attempt should be re-queued. `attempts` counts the
    /// attempt that just failed, so a job gets `max_retries + 1` attempts.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// The position this job occupies in the status×priority index.
    pub fn index_position(&self) -> IndexPosition {
        IndexPosition {
            status: self.status,
            priority: self.priority,
            scheduled_at: self.scheduled_at,
        }
    }

    pub fn matches(&self, filter: &JobFilter) -> bool {
        if let Some(status) = filter.status {
            if self.status != status {
                return false;
            }
        }
        if let Some(job_type) = &filter.job_type {
            if &self.job_type != job_type {
                return false;
            }
        }
        if !filter.tags.is_empty() && !filter.tags.iter().any(|tag| self.tags.contains(tag)) {
            return false;
        }
        if let Some(after) = filter.created_after {
            if self.created_at < after {
                return false;
            }
        }
        if let Some(before) = filter.created_before {
            if self.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Where a job sits in the index. Any change requires moving its bucket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexPosition {
    pub status: JobStatus,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
}

/// The caller-supplied part of a job: which handler runs it and with what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobPayload {
    #[serde(rename = "type")]
    pub job_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl JobPayload {
    pub fn new(job_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            data,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// `now + delay_seconds`, or `None` if that is not a representable instant.
fn delay_from(now: DateTime<Utc>, delay_seconds: u64) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(delay_seconds).ok()?;
    now.checked_add_signed(TimeDelta::try_seconds(seconds)?)
}

/// Whole seconds in `duration`, rounding any fraction up.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

/// Optional scheduling knobs for [`crate::JobProcessor::create_job`].
/// Unset fields fall back to the processor's [`JobDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobOptions {
    pub priority: Option<Priority>,
    pub delay_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// A fractional second rounds up.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_seconds = Some(ceil_secs(delay));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// A fractional second rounds up, so only `Duration::ZERO` means no limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(ceil_secs(timeout));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Values applied to options the caller leaves unset.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub priority: Priority,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            max_retries: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

/// A partial update merged into a stored job by
/// [`crate::JobProcessor::update_job`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub data: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub priority: Option<Priority>,
    pub status: Option<JobStatus>,
    pub max_retries: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub tags: Option<BTreeSet<String>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub(crate) fn apply(self, job: &mut Job) {
        if let Some(data) = self.data {
            job.data = data;
        }
        if let Some(metadata) = self.metadata {
            job.metadata = metadata;
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(max_retries) = self.max_retries {
            job.max_retries = max_retries;
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            job.timeout_seconds = timeout_seconds;
        }
        if let Some(tags) = self.tags {
            job.tags = tags;
        }
        if let Some(scheduled_at) = self.scheduled_at {
            // never move a job before its creation
            job.scheduled_at = scheduled_at.max(job.created_at);
        }
    }
}

/// Query for [`crate::JobProcessor::get_jobs`].
///
/// `tags` matches jobs carrying any of the listed tags. Results are ordered
/// newest first before `offset`/`limit` are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn created_between(mut self, after: DateTime<Utc>, before: DateTime<Utc>) -> Self {
        self.created_after = Some(after);
        self.created_before = Some(before);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}
