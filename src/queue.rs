//! Job persistence and the status×priority index.
//!
//! [`JobQueue`] translates [`Job`] records to key/value entries and keeps one
//! bucket per `(status, priority)` pair so the scheduler can find eligible work
//! without scanning every record.
//!
//! # Layout
//!
//! | key | value | TTL |
//! |---|---|---|
//! | `job:<id>` | JSON [`Job`] | record TTL (24h by default) |
//! | `jobs:queue:<status>:<priority>` | JSON list of [`BucketEntry`] | none |
//!
//! A bucket holds any number of job ids ordered by `(scheduled_at, insertion)`,
//! so same-priority jobs created together are all visible to the scheduler and
//! dispatch FIFO. Inserting uses a binary search for the position.
//!
//! # Consistency
//!
//! Every transition runs (1) remove from the old bucket, (2) persist the record,
//! (3) insert into the new bucket, each awaited before the next. A crash part way
//! leaves the record readable by id and at worst a stale bucket entry. Readers
//! validate each entry against the live record and stale entries are pruned.
//!
//! Within one process, record read-modify-write sequences are serialized by
//! [`JobQueue::update`] and bucket read-modify-write by an index lock. Several
//! processes sharing one store can still race on bucket writes.

use crate::{
    JobkeeperError, Result,
    job::{IndexPosition, Job, JobId, JobStatus},
    priority::Priority,
    store::KeyValueStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const RECORD_PREFIX: &str = "job:";
pub const BUCKET_PREFIX: &str = "jobs:queue:";

/// One job id in a priority bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BucketEntry {
    pub id: JobId,
    pub scheduled_at: DateTime<Utc>,
}

pub struct JobQueue {
    store: Arc<dyn KeyValueStore>,
    record_ttl: Duration,
    write_lock: Mutex<()>,
    index_lock: Mutex<()>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, record_ttl: Duration) -> Self {
        Self {
            store,
            record_ttl,
            write_lock: Mutex::new(()),
            index_lock: Mutex::new(()),
        }
    }

    pub fn record_key(id: JobId) -> String {
        format!("{}{}", RECORD_PREFIX, id)
    }

    pub fn bucket_key(status: JobStatus, priority: Priority) -> String {
        format!("{}{}:{}", BUCKET_PREFIX, status, priority)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        match self.store.get(&Self::record_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persists a new job and indexes it.
    pub async fn insert(&self, job: &Job) -> Result<()> {
        self.persist(job).await?;
        self.index_insert(job).await?;
        debug!(
            "Indexed job {} under {}",
            job.id,
            Self::bucket_key(job.status, job.priority)
        );
        Ok(())
    }

    /// Atomically (within this process) loads a job, lets `f` mutate it, and
    /// writes it back with its index entry moved if needed.
    ///
    /// `f` returns `Ok(true)` to persist the change or `Ok(false)` to leave the
    /// stored job untouched; an error aborts without writing. The returned job
    /// is the stored state afterwards.
    pub async fn update<F>(&self, id: JobId, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<bool>,
    {
        let _guard = self.write_lock.lock().await;

        let mut job = self.get(id).await?.ok_or_else(|| JobkeeperError::not_found(id))?;
        let previous = job.index_position();
        let original = job.clone();

        if !f(&mut job)? {
            return Ok(original);
        }

        self.save(&job, previous).await?;
        Ok(job)
    }

    /// Sets `progress` (clamped to 0..=100) on a processing job. Jobs in any
    /// other status are returned unchanged.
    pub async fn update_progress(&self, id: JobId, value: i64) -> Result<Job> {
        let progress = value.clamp(0, 100) as u8;
        self.update(id, |job| {
            if job.status != JobStatus::Processing || job.progress == progress {
                return Ok(false);
            }
            job.progress = progress;
            Ok(true)
        })
        .await
    }

    /// Removes a job's index entry and then its record. Returns the removed job,
    /// or `None` if it did not exist.
    pub async fn remove(&self, id: JobId) -> Result<Option<Job>> {
        let _guard = self.write_lock.lock().await;

        let Some(job) = self.get(id).await? else {
            return Ok(None);
        };
        self.index_remove(id, job.status, job.priority).await?;
        self.store.delete(&Self::record_key(id)).await?;
        Ok(Some(job))
    }

    /// Raw contents of one bucket, in dispatch order.
    pub async fn bucket(&self, status: JobStatus, priority: Priority) -> Result<Vec<BucketEntry>> {
        self.load_bucket(&Self::bucket_key(status, priority)).await
    }

    /// Up to `limit` jobs from the pending bucket of `priority` that are due at
    /// `now`, oldest `scheduled_at` first. Ids in `skip` are passed over.
    /// Entries whose record is gone, no longer pending, or carries another
    /// priority are pruned from the bucket.
    pub async fn eligible(
        &self,
        priority: Priority,
        now: DateTime<Utc>,
        limit: usize,
        skip: &HashSet<JobId>,
    ) -> Result<Vec<Job>> {
        let mut eligible = Vec::new();
        if limit == 0 {
            return Ok(eligible);
        }

        let entries = self.bucket(JobStatus::Pending, priority).await?;
        let mut stale = Vec::new();

        for entry in entries {
            if entry.scheduled_at > now || eligible.len() >= limit {
                break;
            }
            if skip.contains(&entry.id) {
                continue;
            }
            match self.get(entry.id).await? {
                Some(job) if job.status == JobStatus::Pending && job.priority == priority => {
                    if job.is_eligible(now) {
                        eligible.push(job);
                    }
                }
                _ => stale.push(entry.id),
            }
        }

        if !stale.is_empty() {
            self.prune(JobStatus::Pending, priority, &stale).await?;
        }

        Ok(eligible)
    }

    /// Every job currently in `status`, validated against its record.
    ///
    /// This walks one bucket per priority level, so it costs
    /// O(priorities × bucket size) store reads rather than a single range query.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for priority in Priority::descending() {
            for entry in self.bucket(status, priority).await? {
                if !seen.insert(entry.id) {
                    continue;
                }
                if let Some(job) = self.get(entry.id).await? {
                    if job.status == status && job.priority == priority {
                        jobs.push(job);
                    }
                }
            }
        }

        Ok(jobs)
    }

    /// Every job the index knows about, across all statuses.
    pub async fn all_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for status in JobStatus::ALL {
            jobs.extend(self.jobs_with_status(status).await?);
        }
        Ok(jobs)
    }

    async fn persist(&self, job: &Job) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        self.store
            .set(&Self::record_key(job.id), raw, Some(self.record_ttl))
            .await
    }

    async fn save(&self, job: &Job, previous: IndexPosition) -> Result<()> {
        let current = job.index_position();
        if current == previous {
            return self.persist(job).await;
        }

        self.index_remove(job.id, previous.status, previous.priority)
            .await?;
        self.persist(job).await?;
        self.index_insert(job).await?;

        if previous.status != current.status {
            debug!("Job {} moved {} -> {}", job.id, previous.status, current.status);
        }
        Ok(())
    }

    async fn load_bucket(&self, key: &str) -> Result<Vec<BucketEntry>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn write_bucket(&self, key: &str, entries: &[BucketEntry]) -> Result<()> {
        if entries.is_empty() {
            self.store.delete(key).await
        } else {
            let raw = serde_json::to_string(entries)?;
            self.store.set(key, raw, None).await
        }
    }

    async fn index_insert(&self, job: &Job) -> Result<()> {
        let _guard = self.index_lock.lock().await;

        let key = Self::bucket_key(job.status, job.priority);
        let mut entries = self.load_bucket(&key).await?;
        entries.retain(|entry| entry.id != job.id);

        // after every entry with the same time, keeping FIFO among equals
        let position = entries.partition_point(|entry| entry.scheduled_at <= job.scheduled_at);
        entries.insert(
            position,
            BucketEntry {
                id: job.id,
                scheduled_at: job.scheduled_at,
            },
        );
        self.write_bucket(&key, &entries).await
    }

    async fn index_remove(&self, id: JobId, status: JobStatus, priority: Priority) -> Result<()> {
        let _guard = self.index_lock.lock().await;

        let key = Self::bucket_key(status, priority);
        let mut entries = self.load_bucket(&key).await?;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() != before {
            self.write_bucket(&key, &entries).await?;
        }
        Ok(())
    }

    /// Drops bucket entries that still disagree with their record once the
    /// index lock is held. A job re-queued in the meantime keeps its entry.
    async fn prune(&self, status: JobStatus, priority: Priority, candidates: &[JobId]) -> Result<()> {
        let _guard = self.index_lock.lock().await;

        let mut stale = HashSet::new();
        for &id in candidates {
            let still_stale = match self.get(id).await? {
                Some(job) => job.status != status || job.priority != priority,
                None => true,
            };
            if still_stale {
                stale.insert(id);
            }
        }
        if stale.is_empty() {
            return Ok(());
        }

        let key = Self::bucket_key(status, priority);
        let mut entries = self.load_bucket(&key).await?;
        entries.retain(|entry| !stale.contains(&entry.id));
        self.write_bucket(&key, &entries).await?;

        warn!("Pruned {} stale entries from {}", stale.len(), key);
        Ok(())
    }
}
