//! Redis cache pool management using deadpool-redis

use crate::errors::StoreError;
use deadpool_redis::{Config, Pool, Runtime};

/// Create a Redis connection pool from a Redis URL
///
/// # Arguments
/// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
pub fn create_cache_pool(redis_url: &str) -> Result<Pool, StoreError> {
    let cfg = Config::from_url(redis_url);
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|err| StoreError::PoolCreationFailed {
            details: err.to_string(),
        })
}

/// Redis keys for the engine's shared state
pub mod keys {
    /// Prefix for windowed counters
    pub const COUNTER_PREFIX: &str = "skywarden:count";

    /// Prefix for per-event increment dedup markers
    pub const COUNTER_DEDUP_PREFIX: &str = "skywarden:count-dedup";

    /// Prefix for persisted record and account flags
    pub const FLAGS_PREFIX: &str = "skywarden:flags";

    /// Build a counter key for one period bucket
    pub fn counter_key(name: &str, key: &str, bucket: &str) -> String {
        format!("{}:{}:{}:{}", COUNTER_PREFIX, name, key, bucket)
    }

    /// Build a flag-set key for an account DID or record URI
    pub fn flags_key(subject: &str) -> String {
        format!("{}:{}", FLAGS_PREFIX, subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            keys::counter_key("trivial-harassing", "did:plc:abc", "2024-03-01"),
            "skywarden:count:trivial-harassing:did:plc:abc:2024-03-01"
        );
        assert_eq!(
            keys::flags_key("at://did:plc:abc/app.bsky.feed.post/1"),
            "skywarden:flags:at://did:plc:abc/app.bsky.feed.post/1"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(create_cache_pool("not a url").is_err());
    }
}
