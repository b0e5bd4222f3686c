//! Firehose cursor persistence.
//!
//! Shard workers finish events out of order, so the persisted position is
//! the low-watermark tracked by [`CursorTracker`]: the highest sequence
//! number below which every dispatched event has completed. The
//! [`CursorCheckpointer`] writes that value periodically and once more on
//! shutdown. A restart resumes from the persisted value; anything after it
//! may be delivered again, which the pipeline tolerates.

use async_trait::async_trait;
use deadpool_redis::Pool;
use deadpool_redis::redis::AsyncCommands;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::errors::ConsumerError;
use crate::metrics::{SharedMetricsPublisher, names};

/// Durable home of the cursor.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// `None` when nothing has been persisted (start from the live stream).
    async fn read(&self) -> Result<Option<i64>, ConsumerError>;

    async fn write(&self, cursor: i64) -> Result<(), ConsumerError>;

    fn describe(&self) -> String;
}

/// Cursor kept in a plain text file.
pub struct FileCursorStore {
    path: String,
}

impl FileCursorStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn read(&self) -> Result<Option<i64>, ConsumerError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.trim().parse::<i64>().ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ConsumerError::CursorReadFailed {
                details: format!("{}: {}", self.path, err),
            }),
        }
    }

    async fn write(&self, cursor: i64) -> Result<(), ConsumerError> {
        // Write-then-rename so a crash never leaves a truncated cursor.
        let staging = format!("{}.tmp", self.path);
        tokio::fs::write(&staging, cursor.to_string())
            .await
            .map_err(|err| ConsumerError::CursorWriteFailed {
                details: format!("{}: {}", staging, err),
            })?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|err| ConsumerError::CursorWriteFailed {
                details: format!("{}: {}", self.path, err),
            })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path)
    }
}

/// Cursor kept in Redis with a TTL, so an abandoned deployment eventually
/// restarts from the live stream.
pub struct RedisCursorStore {
    pool: Pool,
    key: String,
    ttl_seconds: u64,
}

impl RedisCursorStore {
    pub fn new(pool: Pool, key: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            pool,
            key: key.into(),
            ttl_seconds,
        }
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn read(&self) -> Result<Option<i64>, ConsumerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| ConsumerError::CursorReadFailed {
                details: err.to_string(),
            })?;
        let value: Option<String> =
            conn.get(&self.key)
                .await
                .map_err(|err| ConsumerError::CursorReadFailed {
                    details: err.to_string(),
                })?;
        Ok(value.and_then(|value| value.parse::<i64>().ok()))
    }

    async fn write(&self, cursor: i64) -> Result<(), ConsumerError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|err| ConsumerError::CursorWriteFailed {
                details: err.to_string(),
            })?;
        let _: () = conn
            .set_ex(&self.key, cursor, self.ttl_seconds)
            .await
            .map_err(|err| ConsumerError::CursorWriteFailed {
                details: err.to_string(),
            })?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("redis:{}", self.key)
    }
}

/// In-process cursor, for tests and dry runs.
#[derive(Default)]
pub struct MemoryCursorStore {
    value: Mutex<Option<i64>>,
}

impl MemoryCursorStore {
    pub fn new(initial: Option<i64>) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn read(&self) -> Result<Option<i64>, ConsumerError> {
        Ok(*self.value.lock())
    }

    async fn write(&self, cursor: i64) -> Result<(), ConsumerError> {
        *self.value.lock() = Some(cursor);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
struct TrackerState {
    /// In-flight sequence numbers with their multiplicity
    in_flight: BTreeMap<i64, usize>,
    highest_completed: Option<i64>,
}

/// Low-watermark over events dispatched to shard workers.
#[derive(Default)]
pub struct CursorTracker {
    state: Mutex<TrackerState>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `seq` as dispatched and not yet finished.
    pub fn begin(&self, seq: i64) {
        *self.state.lock().in_flight.entry(seq).or_insert(0) += 1;
    }

    /// Marks one dispatch of `seq` as finished.
    pub fn complete(&self, seq: i64) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_flight.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                state.in_flight.remove(&seq);
            }
        }
        state.highest_completed = Some(state.highest_completed.map_or(seq, |h| h.max(seq)));
    }

    /// Highest sequence number at or below which nothing is still in flight.
    pub fn safe_cursor(&self) -> Option<i64> {
        let state = self.state.lock();
        let highest = state.highest_completed?;
        match state.in_flight.keys().next() {
            Some(oldest) => Some((oldest - 1).min(highest)),
            None => Some(highest),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.values().sum()
    }
}

/// Periodically persists the tracker's low-watermark.
pub struct CursorCheckpointer {
    store: Arc<dyn CursorStore>,
    tracker: Arc<CursorTracker>,
    metrics: SharedMetricsPublisher,
    interval: Duration,
    last_written: Mutex<Option<i64>>,
}

impl CursorCheckpointer {
    pub fn new(
        store: Arc<dyn CursorStore>,
        tracker: Arc<CursorTracker>,
        metrics: SharedMetricsPublisher,
        interval: Duration,
        initial: Option<i64>,
    ) -> Self {
        Self {
            store,
            tracker,
            metrics,
            interval,
            last_written: Mutex::new(initial),
        }
    }

    /// Writes the current low-watermark if it moved forward. Returns the
    /// value written.
    pub async fn checkpoint(&self) -> Result<Option<i64>, ConsumerError> {
        let Some(cursor) = self.tracker.safe_cursor() else {
            return Ok(None);
        };
        if self.last_written.lock().is_some_and(|last| cursor <= last) {
            return Ok(None);
        }

        self.store.write(cursor).await?;
        *self.last_written.lock() = Some(cursor);

        debug!(cursor, store = %self.store.describe(), "Cursor persisted");
        self.metrics.incr(names::CURSOR_WRITES).await;
        self.metrics
            .gauge(names::CURSOR_POSITION, cursor.max(0) as u64)
            .await;
        Ok(Some(cursor))
    }

    /// Checkpoints every interval until cancelled, then once more after
    /// `workers` has drained, so events still being evaluated at
    /// cancellation are covered by the final write.
    ///
    /// A failed write is retried on the next tick; a failed final write is
    /// returned as an error.
    pub async fn run(&self, token: CancellationToken, workers: TaskTracker) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.checkpoint().await {
                        warn!(error = ?err, store = %self.store.describe(), "Cursor checkpoint failed");
                    }
                }
            }
        }

        workers.close();
        workers.wait().await;

        let written = self.checkpoint().await?;
        info!(cursor = ?written.or(*self.last_written.lock()), "Final cursor checkpoint");
        Ok(())
    }
}
