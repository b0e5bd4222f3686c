//! Moderation effects: proposal during evaluation, application afterwards.
//!
//! Rules never talk to the moderation service directly. They propose
//! [`Effect`]s into an [`EffectCollector`] owned by the evaluation context;
//! once every rule has run the collector is drained and handed to the
//! [`EffectApplier`].

use async_trait::async_trait;
use ordermap::OrderMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::XrpcError;

pub mod applier;
pub mod notify;

pub use applier::{EffectApplier, EffectBatch, FlushReport};
pub use notify::{LoggingNotifier, NotificationSink, SlackNotifier};

/// Closed set of report reason codes accepted by the moderation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportReason {
    Spam,
    Violation,
    Misleading,
    Sexual,
    Rude,
    Other,
}

impl ReportReason {
    pub fn as_lexicon(&self) -> &'static str {
        match self {
            ReportReason::Spam => "com.atproto.moderation.defs#reasonSpam",
            ReportReason::Violation => "com.atproto.moderation.defs#reasonViolation",
            ReportReason::Misleading => "com.atproto.moderation.defs#reasonMisleading",
            ReportReason::Sexual => "com.atproto.moderation.defs#reasonSexual",
            ReportReason::Rude => "com.atproto.moderation.defs#reasonRude",
            ReportReason::Other => "com.atproto.moderation.defs#reasonOther",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportReason::Spam => "spam",
            ReportReason::Violation => "violation",
            ReportReason::Misleading => "misleading",
            ReportReason::Sexual => "sexual",
            ReportReason::Rude => "rude",
            ReportReason::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Internal flag on one record
    RecordFlag { uri: String, flag: String },
    /// Internal flag on the subject account
    AccountFlag(String),
    AccountLabel(String),
    /// Negates a label previously applied to the subject account
    RemoveAccountLabel(String),
    AccountTag(String),
    Report { reason: ReportReason, comment: String },
    Notify { channel: String },
}

/// Identity used for de-duplication and last-writer-wins resolution.
///
/// Adding and removing the same label share a key so the later proposal
/// replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectKey {
    class: &'static str,
    target: String,
    value: String,
}

impl Effect {
    pub fn key(&self) -> EffectKey {
        let (class, target, value) = match self {
            Effect::RecordFlag { uri, flag } => ("record-flag", uri.clone(), flag.clone()),
            Effect::AccountFlag(flag) => ("account-flag", String::new(), flag.clone()),
            Effect::AccountLabel(label) | Effect::RemoveAccountLabel(label) => {
                ("account-label", String::new(), label.clone())
            }
            Effect::AccountTag(tag) => ("account-tag", String::new(), tag.clone()),
            Effect::Report { reason, comment } => (
                "report",
                String::new(),
                format!("{}:{}", reason.as_str(), comment),
            ),
            Effect::Notify { channel } => ("notify", String::new(), channel.clone()),
        };
        EffectKey {
            class,
            target,
            value,
        }
    }

    /// Short kind name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::RecordFlag { .. } => "record-flag",
            Effect::AccountFlag(_) => "account-flag",
            Effect::AccountLabel(_) => "account-label",
            Effect::RemoveAccountLabel(_) => "remove-account-label",
            Effect::AccountTag(_) => "account-tag",
            Effect::Report { .. } => "report",
            Effect::Notify { .. } => "notify",
        }
    }
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Effect::RecordFlag { uri, flag } => write!(f, "record-flag {} on {}", flag, uri),
            Effect::AccountFlag(flag) => write!(f, "account-flag {}", flag),
            Effect::AccountLabel(label) => write!(f, "account-label {}", label),
            Effect::RemoveAccountLabel(label) => write!(f, "remove-account-label {}", label),
            Effect::AccountTag(tag) => write!(f, "account-tag {}", tag),
            Effect::Report { reason, .. } => write!(f, "report {}", reason.as_str()),
            Effect::Notify { channel } => write!(f, "notify {}", channel),
        }
    }
}

/// Effects proposed during one evaluation pass, in proposal order.
#[derive(Debug, Default)]
pub struct EffectCollector {
    proposed: OrderMap<EffectKey, Effect>,
}

impl EffectCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an effect. A later proposal with the same key replaces the
    /// earlier one.
    pub fn propose(&mut self, effect: Effect) {
        self.proposed.insert(effect.key(), effect);
    }

    /// Withdraws a pending proposal. Returns whether one was pending.
    pub fn retract(&mut self, effect: &Effect) -> bool {
        self.proposed.remove(&effect.key()).is_some()
    }

    pub fn contains(&self, effect: &Effect) -> bool {
        self.proposed.get(&effect.key()) == Some(effect)
    }

    pub fn effects(&self) -> impl Iterator<Item = &Effect> {
        self.proposed.values()
    }

    pub fn len(&self) -> usize {
        self.proposed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proposed.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.proposed)
            .into_iter()
            .map(|(_, effect)| effect)
            .collect()
    }
}

/// Durable moderation actions. Every call must be idempotent.
#[async_trait]
pub trait ModerationBackend: Send + Sync {
    async fn add_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError>;

    async fn remove_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError>;

    async fn add_account_tag(&self, did: &str, tag: &str) -> Result<(), XrpcError>;

    async fn report_account(
        &self,
        did: &str,
        reason: ReportReason,
        comment: &str,
    ) -> Result<(), XrpcError>;
}

/// Backend used when no moderation service is configured.
#[derive(Debug, Clone, Default)]
pub struct LoggingModerationBackend;

#[async_trait]
impl ModerationBackend for LoggingModerationBackend {
    async fn add_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        info!(did = %did, label = %label, "Dry run: would label account");
        Ok(())
    }

    async fn remove_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        info!(did = %did, label = %label, "Dry run: would remove account label");
        Ok(())
    }

    async fn add_account_tag(&self, did: &str, tag: &str) -> Result<(), XrpcError> {
        info!(did = %did, tag = %tag, "Dry run: would tag account");
        Ok(())
    }

    async fn report_account(
        &self,
        did: &str,
        reason: ReportReason,
        comment: &str,
    ) -> Result<(), XrpcError> {
        info!(did = %did, reason = reason.as_str(), comment = %comment, "Dry run: would report account");
        Ok(())
    }
}
