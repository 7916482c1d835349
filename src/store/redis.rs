//! Redis-backed [`KeyValueStore`].
//!
//! Records are written with `SET key value EX ttl`; bucket keys (no TTL) with a
//! plain `SET`. The connection is a [`ConnectionManager`], which reconnects on
//! failure and is cheap to clone per call.

use super::KeyValueStore;
use crate::Result;
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!("Connected to Redis store at {}", url);
        Ok(Self {
            connection,
            key_prefix: String::new(),
        })
    }

    /// Namespaces every key, so several deployments can share one Redis database.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut connection = self.connection.clone();
        match ttl {
            // EX 0 is rejected by Redis, round sub-second TTLs up
            Some(ttl) => {
                let seconds = ttl.as_secs().max(1);
                connection
                    .set_ex::<_, _, ()>(self.key(key), value, seconds)
                    .await?
            }
            None => connection.set::<_, _, ()>(self.key(key), value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(self.key(key)).await?;
        Ok(())
    }
}
