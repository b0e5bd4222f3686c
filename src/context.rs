//! Per-event evaluation contexts handed to rules.
//!
//! A context bundles the event being evaluated, the subject's resolved
//! [`AccountMeta`] and the effects proposed so far. Rules read facts through
//! it and propose effects into it; nothing a rule does through a context
//! touches the moderation service. Counter increments are buffered and
//! committed with a per-event dedup key so a redelivered event never counts
//! twice.

use chrono::{DateTime, Duration, Utc};
use ordermap::OrderSet;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{Span, warn};

use crate::account::{AccountCache, AccountMeta, AccountRelationship};
use crate::counters::{CountStore, Period, increment_dedup_key};
use crate::effects::{Effect, EffectBatch, EffectCollector, ReportReason};
use crate::errors::EngineError;
use crate::event::OzoneEvent;
use crate::flags::FlagStore;
use crate::metrics::SharedMetricsPublisher;
use crate::rules::helpers;
use crate::sets::{Normalization, SetStore};

/// Shared services every evaluation reads from.
pub struct EvalServices {
    pub accounts: Arc<AccountCache>,
    pub counters: Arc<dyn CountStore>,
    pub sets: Arc<SetStore>,
    pub flags: Arc<dyn FlagStore>,
    pub metrics: SharedMetricsPublisher,
}

/// State common to every context kind.
pub struct BaseContext {
    services: Arc<EvalServices>,
    pub seq: i64,
    pub account: Arc<AccountMeta>,
    /// Evaluation time, fixed for the whole pass
    pub now: DateTime<Utc>,
    pub span: Span,
    effects: EffectCollector,
    pending_increments: OrderSet<(String, String)>,
    committed_increments: HashSet<(String, String)>,
    relationships: HashMap<String, AccountRelationship>,
}

impl BaseContext {
    pub fn new(services: Arc<EvalServices>, seq: i64, account: Arc<AccountMeta>) -> Self {
        let span = tracing::info_span!("evaluate", seq, did = %account.did());
        Self {
            services,
            seq,
            account,
            now: Utc::now(),
            span,
            effects: EffectCollector::new(),
            pending_increments: OrderSet::new(),
            committed_increments: HashSet::new(),
            relationships: HashMap::new(),
        }
    }

    pub fn did(&self) -> &str {
        self.account.did()
    }

    pub fn services(&self) -> &Arc<EvalServices> {
        &self.services
    }

    pub fn effects(&self) -> &EffectCollector {
        &self.effects
    }

    /// Membership test against the current set snapshot. Unknown sets are
    /// never a match.
    pub fn in_set(&self, name: &str, member: &str, normalization: Normalization) -> bool {
        self.services.sets.in_set(name, member, normalization)
    }

    /// Age of the subject account, `None` when private facts are missing or
    /// the index timestamp is implausible.
    pub fn account_age(&self) -> Option<Duration> {
        self.account
            .private
            .as_ref()
            .and_then(|private| helpers::account_age(private, self.now))
    }

    /// Queues an increment of every window of `name/key`.
    ///
    /// The increment is committed the first time the counter is read in this
    /// pass, or when the pass ends.
    pub fn increment(&mut self, name: &str, key: &str) {
        let counter = (name.to_string(), key.to_string());
        if !self.committed_increments.contains(&counter) {
            self.pending_increments.insert(counter);
        }
    }

    async fn commit_increment(&mut self, name: &str, key: &str) {
        let dedup_key = increment_dedup_key(self.seq, name, key);
        match self
            .services
            .counters
            .increment_once(&dedup_key, name, key, self.now)
            .await
        {
            Ok(false) => {
                tracing::debug!(seq = self.seq, counter = %name, key = %key, "Increment already applied for event");
            }
            Ok(true) => {}
            Err(err) => {
                warn!(seq = self.seq, counter = %name, key = %key, error = ?err, "Failed to increment counter");
            }
        }
        self.committed_increments
            .insert((name.to_string(), key.to_string()));
    }

    /// Reads one window of a counter, including this pass's own increment.
    pub async fn get_count(
        &mut self,
        name: &str,
        key: &str,
        period: Period,
    ) -> Result<i64, EngineError> {
        let counter = (name.to_string(), key.to_string());
        if self.pending_increments.remove(&counter) {
            self.commit_increment(name, key).await;
        }
        self.services
            .counters
            .get_count(name, key, period, self.now)
            .await
            .map_err(|err| EngineError::unavailable("counters", err))
    }

    /// Commits increments that no rule read back.
    pub async fn commit_counters(&mut self) {
        let pending: Vec<(String, String)> = std::mem::take(&mut self.pending_increments)
            .into_iter()
            .collect();
        for (name, key) in pending {
            self.commit_increment(&name, &key).await;
        }
    }

    /// Metadata for another account, served from the account cache.
    pub async fn account_meta(&self, did: &str) -> Result<Arc<AccountMeta>, EngineError> {
        self.services.accounts.resolve(did).await
    }

    /// Relationship of `other` to the subject account, memoized for the pass.
    pub async fn relationship(&mut self, other: &str) -> Result<AccountRelationship, EngineError> {
        if let Some(relationship) = self.relationships.get(other) {
            return Ok(relationship.clone());
        }
        let relationship = self
            .services
            .accounts
            .relationship(self.account.did(), other)
            .await?;
        self.relationships
            .insert(other.to_string(), relationship.clone());
        Ok(relationship)
    }

    pub fn propose(&mut self, effect: Effect) {
        tracing::debug!(seq = self.seq, did = %self.account.did(), effect = %effect, "Effect proposed");
        self.effects.propose(effect);
    }

    pub fn add_account_flag(&mut self, flag: &str) {
        self.propose(Effect::AccountFlag(flag.to_string()));
    }

    pub fn add_account_label(&mut self, label: &str) {
        self.propose(Effect::AccountLabel(label.to_string()));
    }

    pub fn remove_account_label(&mut self, label: &str) {
        self.propose(Effect::RemoveAccountLabel(label.to_string()));
    }

    pub fn add_account_tag(&mut self, tag: &str) {
        self.propose(Effect::AccountTag(tag.to_string()));
    }

    pub fn report_account(&mut self, reason: ReportReason, comment: &str) {
        self.propose(Effect::Report {
            reason,
            comment: comment.to_string(),
        });
    }

    pub fn notify(&mut self, channel: &str) {
        self.propose(Effect::Notify {
            channel: channel.to_string(),
        });
    }

    /// Ends the pass: commits buffered increments and hands the effects off
    /// for application.
    pub async fn into_batch(mut self) -> EffectBatch {
        self.commit_counters().await;
        EffectBatch {
            seq: self.seq,
            did: self.account.did().to_string(),
            handle: self.account.identity.handle.clone(),
            private: self.account.private.clone(),
            effects: self.effects.drain(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Create,
    Update,
    Delete,
}

/// Context for a record create, update or delete.
pub struct RecordContext {
    base: BaseContext,
    pub action: RecordAction,
    pub collection: String,
    pub rkey: String,
    pub cid: Option<String>,
    /// Decoded record; `Value::Null` for deletes
    pub record: Value,
}

impl RecordContext {
    pub fn new(
        base: BaseContext,
        action: RecordAction,
        collection: String,
        rkey: String,
        cid: Option<String>,
        record: Value,
    ) -> Self {
        Self {
            base,
            action,
            collection,
            rkey,
            cid,
            record,
        }
    }

    pub fn uri(&self) -> String {
        format!("at://{}/{}/{}", self.base.did(), self.collection, self.rkey)
    }

    pub fn add_record_flag(&mut self, flag: &str) {
        let uri = self.uri();
        self.base.propose(Effect::RecordFlag {
            uri,
            flag: flag.to_string(),
        });
    }

    pub fn into_base(self) -> BaseContext {
        self.base
    }
}

/// Context for account status changes.
pub struct AccountContext {
    base: BaseContext,
}

impl AccountContext {
    pub fn new(base: BaseContext) -> Self {
        Self { base }
    }

    pub fn into_base(self) -> BaseContext {
        self.base
    }
}

/// Context for handle or DID document changes.
pub struct IdentityContext {
    base: BaseContext,
}

impl IdentityContext {
    pub fn new(base: BaseContext) -> Self {
        Self { base }
    }

    pub fn into_base(self) -> BaseContext {
        self.base
    }
}

/// Context for an action a human moderator took in Ozone.
pub struct OzoneEventContext {
    base: BaseContext,
    pub event: OzoneEvent,
}

impl OzoneEventContext {
    pub fn new(base: BaseContext, event: OzoneEvent) -> Self {
        Self { base, event }
    }

    pub fn into_base(self) -> BaseContext {
        self.base
    }
}

macro_rules! deref_to_base {
    ($($context:ty),+) => {
        $(
            impl Deref for $context {
                type Target = BaseContext;

                fn deref(&self) -> &BaseContext {
                    &self.base
                }
            }

            impl DerefMut for $context {
                fn deref_mut(&mut self) -> &mut BaseContext {
                    &mut self.base
                }
            }
        )+
    };
}

deref_to_base!(RecordContext, AccountContext, IdentityContext, OzoneEventContext);
