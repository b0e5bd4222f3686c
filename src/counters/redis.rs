use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Pool as RedisPool, redis, redis::AsyncCommands};
use metrohash::MetroHash64;
use std::hash::{Hash, Hasher};
use tracing::debug;

use super::{CountStore, DEDUP_TTL, Period};
use crate::cache::keys::{COUNTER_DEDUP_PREFIX, counter_key};
use crate::errors::StoreError;

/// Redis-backed counter store shared by every engine instance.
#[derive(Debug, Clone)]
pub struct RedisCountStore {
    pool: RedisPool,
    key_namespace: Option<String>,
}

impl RedisCountStore {
    pub fn new(pool: RedisPool) -> Self {
        Self {
            pool,
            key_namespace: None,
        }
    }

    /// Prefixes every key, used to isolate test runs sharing one server.
    pub fn with_namespace(pool: RedisPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            key_namespace: Some(namespace.into()),
        }
    }

    fn key(&self, raw: String) -> String {
        match &self.key_namespace {
            Some(ns) => format!("{}:{}", ns, raw),
            None => raw,
        }
    }

    /// Dedup markers are hashed so arbitrary counter keys stay short.
    fn dedup_key(&self, dedup_key: &str) -> String {
        let mut hasher = MetroHash64::new();
        dedup_key.hash(&mut hasher);
        self.key(format!("{}:{:016x}", COUNTER_DEDUP_PREFIX, hasher.finish()))
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|source| StoreError::ConnectionFailed { source })
    }

    fn increment_pipeline(&self, name: &str, key: &str, now: DateTime<Utc>) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        for period in Period::ALL {
            let cell_key = self.key(counter_key(name, key, &period.bucket(now)));
            pipe.incr(&cell_key, 1).ignore();
            if let Some(ttl) = period.ttl() {
                pipe.expire(&cell_key, ttl.as_secs() as i64).ignore();
            }
        }
        pipe
    }
}

#[async_trait]
impl CountStore for RedisCountStore {
    async fn get_count(
        &self,
        name: &str,
        key: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.connection().await?;
        let cell_key = self.key(counter_key(name, key, &period.bucket(now)));

        let value: Option<i64> =
            conn.get(&cell_key)
                .await
                .map_err(|source| StoreError::RedisOperationFailed {
                    operation: "GET".to_string(),
                    source,
                })?;

        Ok(value.unwrap_or(0))
    }

    async fn increment(&self, name: &str, key: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let pipe = self.increment_pipeline(name, key, now);

        let _: () = pipe.query_async(&mut conn).await.map_err(|source| {
            StoreError::RedisOperationFailed {
                operation: "INCR".to_string(),
                source,
            }
        })?;
        Ok(())
    }

    async fn increment_once(
        &self,
        dedup_key: &str,
        name: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let marker = self.dedup_key(dedup_key);

        // SET NX returns nil when the marker already exists.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&marker)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|source| StoreError::RedisOperationFailed {
                operation: "SET NX".to_string(),
                source,
            })?;

        if claimed.is_none() {
            debug!(dedup_key = %dedup_key, "Counter increment already applied");
            return Ok(false);
        }

        let pipe = self.increment_pipeline(name, key, now);
        let _: () = pipe.query_async(&mut conn).await.map_err(|source| {
            StoreError::RedisOperationFailed {
                operation: "INCR".to_string(),
                source,
            }
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::create_cache_pool;

    async fn redis_pool() -> Option<RedisPool> {
        let url = std::env::var("TEST_REDIS_URL").ok()?;
        let pool = create_cache_pool(&url).ok()?;
        pool.get().await.ok()?;
        Some(pool)
    }

    #[tokio::test]
    async fn test_redis_counter_roundtrip() {
        let Some(pool) = redis_pool().await else {
            eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
            return;
        };
        let store = RedisCountStore::with_namespace(pool, format!("test:{}", uuid::Uuid::new_v4()));

        let now = Utc::now();
        assert_eq!(store.get_count("posts", "k", Period::Hour, now).await.unwrap(), 0);
        store.increment("posts", "k", now).await.unwrap();
        store.increment("posts", "k", now).await.unwrap();
        for period in Period::ALL {
            assert_eq!(store.get_count("posts", "k", period, now).await.unwrap(), 2);
        }
    }

    #[tokio::test]
    async fn test_redis_increment_once() {
        let Some(pool) = redis_pool().await else {
            eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
            return;
        };
        let store = RedisCountStore::with_namespace(pool, format!("test:{}", uuid::Uuid::new_v4()));

        let now = Utc::now();
        assert!(store.increment_once("1:posts:k", "posts", "k", now).await.unwrap());
        assert!(!store.increment_once("1:posts:k", "posts", "k", now).await.unwrap());
        assert_eq!(store.get_count("posts", "k", Period::Day, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redis_read_uses_increment_bucket_at_boundary() {
        let Some(pool) = redis_pool().await else {
            eprintln!("Skipping test: Redis not available. Set TEST_REDIS_URL to enable.");
            return;
        };
        let store = RedisCountStore::with_namespace(pool, format!("test:{}", uuid::Uuid::new_v4()));
        let pass_time = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 3, 1, 23, 59, 59).unwrap();

        assert!(store.increment_once("6:f:k", "f", "k", pass_time).await.unwrap());
        assert_eq!(store.get_count("f", "k", Period::Day, pass_time).await.unwrap(), 1);
        assert_eq!(store.get_count("f", "k", Period::Hour, pass_time).await.unwrap(), 1);
    }

    #[test]
    fn test_dedup_key_is_hashed() {
        let pool = create_cache_pool("redis://localhost:6379").unwrap();
        let store = RedisCountStore::new(pool);
        let key = store.dedup_key("12:posts:did:plc:abc");
        assert!(key.starts_with("skywarden:count-dedup:"));
        assert_eq!(key.len(), "skywarden:count-dedup:".len() + 16);
        assert_eq!(key, store.dedup_key("12:posts:did:plc:abc"));
    }
}
