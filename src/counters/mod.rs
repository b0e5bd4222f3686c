//! Time-windowed event counters.
//!
//! A counter is addressed by `(name, key)` and tracked in three windows at
//! once: the current UTC hour, the current UTC day and an unbounded total.
//! Every operation takes the caller's clock reading. Incrementing and reading
//! with the same `now` resolve to the same [`Period::bucket`], so a read
//! issued right after an increment lands in the bucket it touched even when
//! the wall clock crosses an hour or day boundary in between.

use crate::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use memory::MemoryCountStore;
pub use redis::RedisCountStore;

/// Counting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Hour,
    Day,
    Total,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Hour, Period::Day, Period::Total];

    /// Bucket identifier for the window containing `now`.
    pub fn bucket(&self, now: DateTime<Utc>) -> String {
        match self {
            Period::Hour => now.format("%Y-%m-%dT%H").to_string(),
            Period::Day => now.format("%Y-%m-%d").to_string(),
            Period::Total => "total".to_string(),
        }
    }

    /// How long a bucket is kept after its first increment.
    ///
    /// Twice the window length so a bucket never expires while it is still
    /// the current one.
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Period::Hour => Some(Duration::from_secs(2 * 60 * 60)),
            Period::Day => Some(Duration::from_secs(2 * 24 * 60 * 60)),
            Period::Total => None,
        }
    }
}

/// How long an increment dedup marker is remembered.
pub(crate) const DEDUP_TTL: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Storage for windowed counters.
///
/// Implementations must be safe under concurrent increments of the same key.
#[async_trait]
pub trait CountStore: Send + Sync {
    /// Value of the window containing `now`; zero for unknown or expired keys.
    async fn get_count(
        &self,
        name: &str,
        key: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Increments every window containing `now`.
    async fn increment(&self, name: &str, key: &str, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Increments every window containing `now` unless `dedup_key` has
    /// already been applied.
    ///
    /// Returns `true` when the increment was applied by this call.
    async fn increment_once(
        &self,
        dedup_key: &str,
        name: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Dedup key for an increment issued while evaluating event `seq`.
pub fn increment_dedup_key(seq: i64, name: &str, key: &str) -> String {
    format!("{}:{}:{}", seq, name, key)
}
