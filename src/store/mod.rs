//! Persistent key/value store adapters.
//!
//! The job queue persists everything through the [`KeyValueStore`] trait: job
//! records under `job:<id>` and priority buckets under
//! `jobs:queue:<status>:<priority>`. Atomicity is assumed per key only; the
//! queue never relies on multi-key transactions.
//!
//! Two adapters ship with the crate:
//!
//! - [`memory::MemoryStore`]: in-process map with per-key TTL, used for tests and
//!   single-process deployments
//! - `redis::RedisStore` (feature `redis`): `GET`/`SET EX`/`DEL` against Redis

use crate::Result;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Minimal contract the queue needs from its backing store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, or `None` if it is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value. With a `ttl`
    /// the key expires after that long; without one it lives until deleted.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Removes `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }
}
