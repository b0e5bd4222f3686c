//! Account metadata and the read-through account cache.
//!
//! [`AccountMeta`] merges three sources: the identity directory (DID, handle,
//! PDS), public profile facts from the AppView, and private moderation facts
//! from the moderation service. Private facts are `None` until an
//! authenticated fetch has succeeded; rules read that as "unknown".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{EngineError, XrpcError};

mod cache;

pub use cache::{AccountCache, AccountCacheConfig};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub did: String,
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
}

impl Identity {
    pub fn new(did: &str) -> Self {
        Self {
            did: did.to_string(),
            handle: None,
            pds_endpoint: None,
        }
    }
}

/// Facts anyone can read from the AppView.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountPublic {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub followers_count: i64,
    pub follows_count: i64,
    pub posts_count: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Facts only the moderation service knows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountPrivate {
    /// When the network first indexed the account
    pub indexed_at: Option<DateTime<Utc>>,
    pub account_tags: Vec<String>,
    pub labels: Vec<String>,
    pub takendown: bool,
}

impl AccountPrivate {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.account_tags.iter().any(|t| t == tag)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccountMeta {
    pub identity: Identity,
    pub public: Option<AccountPublic>,
    pub private: Option<AccountPrivate>,
}

impl AccountMeta {
    pub fn did(&self) -> &str {
        &self.identity.did
    }
}

/// How `did` relates to the account being evaluated (the actor).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountRelationship {
    pub did: String,
    /// The actor follows `did`
    pub following: bool,
    /// `did` follows the actor
    pub followed_by: bool,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn lookup_did(&self, did: &str) -> Result<Identity, EngineError>;

    /// Drops any cached identity for `did`.
    async fn purge(&self, did: &str);
}

#[async_trait]
pub trait PublicAccountSource: Send + Sync {
    async fn profile(&self, did: &str) -> Result<AccountPublic, XrpcError>;

    async fn relationship(&self, actor: &str, other: &str)
    -> Result<AccountRelationship, XrpcError>;
}

#[async_trait]
pub trait PrivateAccountSource: Send + Sync {
    async fn private_facts(&self, did: &str) -> Result<AccountPrivate, XrpcError>;
}

/// Public source used when no AppView is reachable; every account looks
/// profile-less and unrelated.
#[derive(Debug, Clone, Default)]
pub struct NoopPublicAccountSource;

#[async_trait]
impl PublicAccountSource for NoopPublicAccountSource {
    async fn profile(&self, _did: &str) -> Result<AccountPublic, XrpcError> {
        Ok(AccountPublic::default())
    }

    async fn relationship(
        &self,
        _actor: &str,
        other: &str,
    ) -> Result<AccountRelationship, XrpcError> {
        Ok(AccountRelationship {
            did: other.to_string(),
            ..Default::default()
        })
    }
}

pub(crate) fn log_degraded(did: &str, component: &'static str, err: &XrpcError) {
    match err {
        XrpcError::NotFound { .. } => {
            debug!(did = %did, component, "Account facts not found");
        }
        _ => {
            warn!(did = %did, component, error = ?err, "Account facts unavailable, continuing with partial metadata");
        }
    }
}

pub(crate) fn build_cache(capacity: u64, ttl: Duration) -> Cache<String, Arc<AccountMeta>> {
    Cache::builder()
        .max_capacity(capacity)
        .time_to_live(ttl)
        .build()
}
