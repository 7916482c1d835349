//! In-memory [`KeyValueStore`] with per-key expiry.
//!
//! Expiry is evaluated against an injectable [`Clock`], so advancing a
//! [`crate::clock::MockClock`] past a record's TTL makes it disappear exactly as
//! it would in Redis.
//!
//! ```rust
//! # #[tokio::main]
//! # async fn main() -> jobkeeper::Result<()> {
//! use jobkeeper::clock::MockClock;
//! use jobkeeper::store::{KeyValueStore, MemoryStore};
//! use std::{sync::Arc, time::Duration};
//!
//! let clock = MockClock::new();
//! let store = MemoryStore::with_clock(Arc::new(clock.clone()));
//!
//! store.set("job:1", "{}".to_string(), Some(Duration::from_secs(60))).await?;
//! assert!(store.get("job:1").await?.is_some());
//!
//! clock.advance(chrono::Duration::seconds(61));
//! assert!(store.get("job:1").await?.is_none());
//! # Ok(())
//! # }
//! ```

use super::KeyValueStore;
use crate::{
    Result,
    clock::{Clock, SystemClock},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live (unexpired) keys.
    pub async fn len(&self) -> usize {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.values().filter(|entry| !entry.is_expired(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries.get(key).is_some_and(|entry| !entry.is_expired(now))
    }

    /// Live keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drops every expired key and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // expired: drop it so the map doesn't grow unbounded
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        // a TTL too large to represent means the key never expires
        let expires_at = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl));
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}
