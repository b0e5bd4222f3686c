//! Persistent record and account flags.
//!
//! Flags are internal markers raised by rules. They are stored per subject
//! (account DID or record URI) so later evaluations and operators can see
//! them, and so a notification is only sent the first time a flag appears.

use async_trait::async_trait;
use deadpool_redis::{Pool as RedisPool, redis, redis::AsyncCommands};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use crate::cache::keys::flags_key;
use crate::errors::StoreError;

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Flags currently recorded for `subject`.
    async fn get_flags(&self, subject: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Records flags and returns the ones that were not already present.
    async fn add_flags(&self, subject: &str, flags: &[String]) -> Result<Vec<String>, StoreError>;
}

#[derive(Default)]
pub struct MemoryFlagStore {
    flags: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn get_flags(&self, subject: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.flags.lock().get(subject).cloned().unwrap_or_default())
    }

    async fn add_flags(&self, subject: &str, flags: &[String]) -> Result<Vec<String>, StoreError> {
        let mut all = self.flags.lock();
        let existing = all.entry(subject.to_string()).or_default();
        Ok(flags
            .iter()
            .filter(|flag| existing.insert((*flag).clone()))
            .cloned()
            .collect())
    }
}

/// Flags kept in one Redis set per subject.
#[derive(Debug, Clone)]
pub struct RedisFlagStore {
    pool: RedisPool,
}

impl RedisFlagStore {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlagStore for RedisFlagStore {
    async fn get_flags(&self, subject: &str) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|source| StoreError::ConnectionFailed { source })?;

        let members: Vec<String> = conn.smembers(flags_key(subject)).await.map_err(|source| {
            StoreError::RedisOperationFailed {
                operation: "SMEMBERS".to_string(),
                source,
            }
        })?;
        Ok(members.into_iter().collect())
    }

    async fn add_flags(&self, subject: &str, flags: &[String]) -> Result<Vec<String>, StoreError> {
        if flags.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|source| StoreError::ConnectionFailed { source })?;

        let key = flags_key(subject);
        let mut pipe = redis::pipe();
        for flag in flags {
            pipe.sadd(&key, flag);
        }

        // One SADD per flag so each reply says whether that flag was new.
        let added: Vec<i64> = pipe.query_async(&mut conn).await.map_err(|source| {
            StoreError::RedisOperationFailed {
                operation: "SADD".to_string(),
                source,
            }
        })?;

        Ok(flags
            .iter()
            .zip(added)
            .filter(|(_, added)| *added > 0)
            .map(|(flag, _)| flag.clone())
            .collect())
    }
}
