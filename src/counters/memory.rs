use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{CountStore, DEDUP_TTL, Period};
use crate::cache::keys::counter_key;
use crate::errors::StoreError;

/// Expired entries are swept after this many writes.
const PRUNE_EVERY: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct Cell {
    value: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl Cell {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Counters {
    cells: HashMap<String, Cell>,
    applied: HashMap<String, DateTime<Utc>>,
    writes: u64,
}

impl Counters {
    fn bump(&mut self, name: &str, key: &str, now: DateTime<Utc>) {
        for period in Period::ALL {
            let cell_key = counter_key(name, key, &period.bucket(now));
            let expires_at = period
                .ttl()
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl);

            match self.cells.get_mut(&cell_key) {
                Some(cell) if cell.live(now) => cell.value += 1,
                _ => {
                    self.cells.insert(
                        cell_key,
                        Cell {
                            value: 1,
                            expires_at,
                        },
                    );
                }
            }
        }

        self.writes += 1;
        if self.writes % PRUNE_EVERY == 0 {
            self.prune(now);
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        self.cells.retain(|_, cell| cell.live(now));
        self.applied.retain(|_, expires_at| *expires_at > now);
    }
}

/// Process-local counter store.
///
/// Used when no Redis URL is configured and in tests. Counts are lost on
/// restart.
#[derive(Default)]
pub struct MemoryCountStore {
    inner: Mutex<Counters>,
}

impl MemoryCountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_at(&self, name: &str, key: &str, now: DateTime<Utc>) {
        self.inner.lock().bump(name, key, now);
    }

    pub(crate) fn increment_once_at(
        &self,
        dedup_key: &str,
        name: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut inner = self.inner.lock();
        if let Some(expires_at) = inner.applied.get(dedup_key)
            && *expires_at > now
        {
            return false;
        }

        let marker_ttl = chrono::Duration::from_std(DEDUP_TTL).unwrap_or(chrono::Duration::days(2));
        inner.applied.insert(dedup_key.to_string(), now + marker_ttl);
        inner.bump(name, key, now);
        true
    }

    pub(crate) fn get_count_at(
        &self,
        name: &str,
        key: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> i64 {
        let cell_key = counter_key(name, key, &period.bucket(now));
        self.inner
            .lock()
            .cells
            .get(&cell_key)
            .filter(|cell| cell.live(now))
            .map(|cell| cell.value)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CountStore for MemoryCountStore {
    async fn get_count(
        &self,
        name: &str,
        key: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(self.get_count_at(name, key, period, now))
    }

    async fn increment(&self, name: &str, key: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.increment_at(name, key, now);
        Ok(())
    }

    async fn increment_once(
        &self,
        dedup_key: &str,
        name: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self.increment_once_at(dedup_key, name, key, now))
    }
}
