//! Named membership sets used by rules.
//!
//! Sets are loaded from a JSON object mapping set names to member lists:
//!
//! ```json
//! { "bad-hashtags": ["spamtag"], "harassment-target-dids": ["did:plc:..."] }
//! ```
//!
//! Readers always observe one complete snapshot. A reload builds a new
//! snapshot off to the side and swaps it in under a short write lock.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::StoreError;

/// How a lookup compares the candidate member against set contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    Exact,
    /// Case-insensitive comparison, used for hashtags and handles.
    Lowercase,
}

#[derive(Debug, Default)]
struct NamedSet {
    exact: HashSet<String>,
    folded: HashSet<String>,
}

impl NamedSet {
    fn from_members(members: Vec<String>) -> Self {
        let folded = members.iter().map(|m| m.to_lowercase()).collect();
        Self {
            exact: members.into_iter().collect(),
            folded,
        }
    }

    fn contains(&self, member: &str, normalization: Normalization) -> bool {
        match normalization {
            Normalization::Exact => self.exact.contains(member),
            Normalization::Lowercase => self.folded.contains(&member.to_lowercase()),
        }
    }
}

type Snapshot = Arc<HashMap<String, NamedSet>>;

#[derive(Default)]
pub struct SetStore {
    snapshot: RwLock<Snapshot>,
}

impl SetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sets(sets: HashMap<String, Vec<String>>) -> Self {
        let store = Self::new();
        store.replace(sets);
        store
    }

    /// Membership test. Unknown sets are treated as empty.
    pub fn in_set(&self, name: &str, member: &str, normalization: Normalization) -> bool {
        let snapshot = self.snapshot.read().clone();
        snapshot
            .get(name)
            .is_some_and(|set| set.contains(member, normalization))
    }

    pub fn set_names(&self) -> Vec<String> {
        let snapshot = self.snapshot.read().clone();
        let mut names: Vec<String> = snapshot.keys().cloned().collect();
        names.sort();
        names
    }

    /// Atomically replaces every set.
    pub fn replace(&self, sets: HashMap<String, Vec<String>>) {
        let next: HashMap<String, NamedSet> = sets
            .into_iter()
            .map(|(name, members)| (name, NamedSet::from_members(members)))
            .collect();
        *self.snapshot.write() = Arc::new(next);
    }

    /// Reads a sets file without touching the current snapshot.
    pub async fn load_json_file(path: &str) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|err| StoreError::SetLoadFailed {
                    path: path.to_string(),
                    details: err.to_string(),
                })?;

        serde_json::from_str(&content).map_err(|err| StoreError::SetLoadFailed {
            path: path.to_string(),
            details: err.to_string(),
        })
    }

    /// Loads `path` and swaps it in. On failure the previous snapshot stays.
    pub async fn reload_from(&self, path: &str) -> Result<(), StoreError> {
        match Self::load_json_file(path).await {
            Ok(sets) => {
                let total: usize = sets.values().map(Vec::len).sum();
                info!(path = %path, sets = sets.len(), members = total, "Loaded named sets");
                self.replace(sets);
                Ok(())
            }
            Err(err) => {
                warn!(path = %path, error = ?err, "Keeping previous named sets");
                Err(err)
            }
        }
    }
}
