//! Shared fixtures for unit tests.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::account::{
    AccountCache, AccountCacheConfig, AccountMeta, AccountPrivate, AccountPublic,
    AccountRelationship, Identity, IdentityDirectory, PrivateAccountSource, PublicAccountSource,
};
use crate::constants::COLLECTION_POST;
use crate::context::{BaseContext, EvalServices, OzoneEventContext, RecordAction, RecordContext};
use crate::counters::{CountStore, MemoryCountStore};
use crate::effects::{ModerationBackend, NotificationSink, ReportReason};
use crate::errors::{EngineError, XrpcError};
use crate::event::OzoneEvent;
use crate::flags::MemoryFlagStore;
use crate::metrics::NoOpMetricsPublisher;
use crate::sets::SetStore;

pub const AUTHOR_DID: &str = "did:plc:author";

/// Serializes tests that touch process environment variables.
pub static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Moderation backend that records successful calls.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<String>>,
    fail_labels: AtomicBool,
    transient_failures: AtomicUsize,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Label calls fail permanently from now on.
    pub fn fail_labels(&self) {
        self.fail_labels.store(true, Ordering::SeqCst);
    }

    /// The next `count` calls fail with a retryable error.
    pub fn fail_next_transient(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    fn call(&self, method: &str, entry: String) -> Result<(), XrpcError> {
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(XrpcError::Status {
                method: method.to_string(),
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        self.calls.lock().push(entry);
        Ok(())
    }

    fn label_call(&self, method: &str, entry: String) -> Result<(), XrpcError> {
        if self.fail_labels.load(Ordering::SeqCst) {
            return Err(XrpcError::Status {
                method: method.to_string(),
                status: 400,
                body: "rejected".to_string(),
            });
        }
        self.call(method, entry)
    }
}

#[async_trait]
impl ModerationBackend for RecordingBackend {
    async fn add_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.label_call("label", format!("label:{}:{}", did, label))
    }

    async fn remove_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.label_call("unlabel", format!("unlabel:{}:{}", did, label))
    }

    async fn add_account_tag(&self, did: &str, tag: &str) -> Result<(), XrpcError> {
        self.call("tag", format!("tag:{}:{}", did, tag))
    }

    async fn report_account(
        &self,
        did: &str,
        reason: ReportReason,
        comment: &str,
    ) -> Result<(), XrpcError> {
        self.call(
            "report",
            format!("report:{}:{}:{}", did, reason.as_str(), comment),
        )
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, channel: &str, message: &str) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("webhook unreachable");
        }
        self.messages
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// In-memory social graph and private facts. Every DID resolves.
#[derive(Default)]
pub struct StaticAccounts {
    follows: Mutex<HashSet<(String, String)>>,
    private: Mutex<HashMap<String, AccountPrivate>>,
    relationship_calls: AtomicUsize,
}

impl StaticAccounts {
    pub fn add_follow(&self, follower: &str, followed: &str) {
        self.follows
            .lock()
            .insert((follower.to_string(), followed.to_string()));
    }

    pub fn set_private(&self, did: &str, private: AccountPrivate) {
        self.private.lock().insert(did.to_string(), private);
    }

    pub fn relationship_calls(&self) -> usize {
        self.relationship_calls.load(Ordering::SeqCst)
    }

    fn follows(&self, follower: &str, followed: &str) -> bool {
        self.follows
            .lock()
            .contains(&(follower.to_string(), followed.to_string()))
    }
}

#[async_trait]
impl IdentityDirectory for StaticAccounts {
    async fn lookup_did(&self, did: &str) -> Result<Identity, EngineError> {
        Ok(Identity::new(did))
    }

    async fn purge(&self, _did: &str) {}
}

#[async_trait]
impl PublicAccountSource for StaticAccounts {
    async fn profile(&self, _did: &str) -> Result<AccountPublic, XrpcError> {
        Ok(AccountPublic::default())
    }

    async fn relationship(
        &self,
        actor: &str,
        other: &str,
    ) -> Result<AccountRelationship, XrpcError> {
        self.relationship_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccountRelationship {
            did: other.to_string(),
            following: self.follows(actor, other),
            followed_by: self.follows(other, actor),
        })
    }
}

#[async_trait]
impl PrivateAccountSource for StaticAccounts {
    async fn private_facts(&self, did: &str) -> Result<AccountPrivate, XrpcError> {
        Ok(self.private.lock().get(did).cloned().unwrap_or_default())
    }
}

fn build_services(
    accounts: Arc<StaticAccounts>,
    counters: Arc<dyn CountStore>,
    sets: HashMap<String, Vec<String>>,
) -> Arc<EvalServices> {
    let cache = AccountCache::new(
        accounts.clone(),
        accounts.clone(),
        Some(accounts),
        AccountCacheConfig::default(),
    );
    Arc::new(EvalServices {
        accounts: Arc::new(cache),
        counters,
        sets: Arc::new(SetStore::from_sets(sets)),
        flags: Arc::new(MemoryFlagStore::new()),
        metrics: Arc::new(NoOpMetricsPublisher::new()),
    })
}

pub fn test_services(counters: Arc<dyn CountStore>) -> Arc<EvalServices> {
    build_services(Arc::new(StaticAccounts::default()), counters, HashMap::new())
}

pub fn test_services_with_sets(sets: HashMap<String, Vec<String>>) -> Arc<EvalServices> {
    build_services(
        Arc::new(StaticAccounts::default()),
        Arc::new(MemoryCountStore::new()),
        sets,
    )
}

pub fn test_services_with_accounts(
    accounts: Arc<StaticAccounts>,
    sets: HashMap<String, Vec<String>>,
) -> Arc<EvalServices> {
    build_services(accounts, Arc::new(MemoryCountStore::new()), sets)
}

fn subject(did: &str, private: Option<AccountPrivate>) -> Arc<AccountMeta> {
    Arc::new(AccountMeta {
        identity: Identity::new(did),
        public: Some(AccountPublic::default()),
        private,
    })
}

/// Context for a post created by [`AUTHOR_DID`].
pub fn post_context(
    services: Arc<EvalServices>,
    seq: i64,
    private: Option<AccountPrivate>,
    record: serde_json::Value,
) -> RecordContext {
    let base = BaseContext::new(services, seq, subject(AUTHOR_DID, private));
    RecordContext::new(
        base,
        RecordAction::Create,
        COLLECTION_POST.to_string(),
        "3l3qo2vuowo2b".to_string(),
        None,
        record,
    )
}

pub fn ozone_context(
    services: Arc<EvalServices>,
    seq: i64,
    event: OzoneEvent,
) -> OzoneEventContext {
    let base = BaseContext::new(services, seq, subject(&event.subject_did, None));
    OzoneEventContext::new(base, event)
}
