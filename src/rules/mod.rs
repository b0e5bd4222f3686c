//! Rule contracts, the rule registry and the ordered rule set.
//!
//! A rule is a named check over exactly one context kind. Rules are
//! registered by name in a [`RuleRegistry`] and arranged into a [`RuleSet`]
//! by a [`RulesConfig`], which lists rule names per kind in run order. Later
//! rules can observe effects proposed by earlier ones in the same pass.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::{AccountContext, IdentityContext, OzoneEventContext, RecordContext};
use crate::errors::{ConfigError, StoreError};

pub mod harassment;
pub mod hashtags;
pub mod helpers;
pub mod records;

use records::{Post, Profile};

#[async_trait]
pub trait PostRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut RecordContext, post: &Post) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ProfileRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut RecordContext, profile: &Profile) -> anyhow::Result<()>;
}

/// Runs on every record create or update, whatever the collection.
#[async_trait]
pub trait RecordRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut RecordContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RecordDeleteRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut RecordContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait IdentityRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut IdentityContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AccountRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut AccountContext) -> anyhow::Result<()>;
}

#[async_trait]
pub trait OzoneEventRule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &mut OzoneEventContext) -> anyhow::Result<()>;
}

/// The context kinds rules can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Post,
    Profile,
    Record,
    RecordDelete,
    Identity,
    Account,
    OzoneEvent,
}

impl RuleKind {
    pub const ALL: [RuleKind; 7] = [
        RuleKind::Post,
        RuleKind::Profile,
        RuleKind::Record,
        RuleKind::RecordDelete,
        RuleKind::Identity,
        RuleKind::Account,
        RuleKind::OzoneEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Post => "post",
            RuleKind::Profile => "profile",
            RuleKind::Record => "record",
            RuleKind::RecordDelete => "record_delete",
            RuleKind::Identity => "identity",
            RuleKind::Account => "account",
            RuleKind::OzoneEvent => "ozone_event",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule of any kind.
#[derive(Clone)]
pub enum Rule {
    Post(Arc<dyn PostRule>),
    Profile(Arc<dyn ProfileRule>),
    Record(Arc<dyn RecordRule>),
    RecordDelete(Arc<dyn RecordDeleteRule>),
    Identity(Arc<dyn IdentityRule>),
    Account(Arc<dyn AccountRule>),
    OzoneEvent(Arc<dyn OzoneEventRule>),
}

impl Rule {
    pub fn name(&self) -> &'static str {
        match self {
            Rule::Post(rule) => rule.name(),
            Rule::Profile(rule) => rule.name(),
            Rule::Record(rule) => rule.name(),
            Rule::RecordDelete(rule) => rule.name(),
            Rule::Identity(rule) => rule.name(),
            Rule::Account(rule) => rule.name(),
            Rule::OzoneEvent(rule) => rule.name(),
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Post(_) => RuleKind::Post,
            Rule::Profile(_) => RuleKind::Profile,
            Rule::Record(_) => RuleKind::Record,
            Rule::RecordDelete(_) => RuleKind::RecordDelete,
            Rule::Identity(_) => RuleKind::Identity,
            Rule::Account(_) => RuleKind::Account,
            Rule::OzoneEvent(_) => RuleKind::OzoneEvent,
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rule({}:{})", self.kind(), self.name())
    }
}

/// Rules partitioned by kind, each partition in run order.
#[derive(Clone, Default)]
pub struct RuleSet {
    pub post: Vec<Arc<dyn PostRule>>,
    pub profile: Vec<Arc<dyn ProfileRule>>,
    pub record: Vec<Arc<dyn RecordRule>>,
    pub record_delete: Vec<Arc<dyn RecordDeleteRule>>,
    pub identity: Vec<Arc<dyn IdentityRule>>,
    pub account: Vec<Arc<dyn AccountRule>>,
    pub ozone_event: Vec<Arc<dyn OzoneEventRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule to the end of its kind's partition.
    pub fn push(&mut self, rule: Rule) {
        match rule {
            Rule::Post(rule) => self.post.push(rule),
            Rule::Profile(rule) => self.profile.push(rule),
            Rule::Record(rule) => self.record.push(rule),
            Rule::RecordDelete(rule) => self.record_delete.push(rule),
            Rule::Identity(rule) => self.identity.push(rule),
            Rule::Account(rule) => self.account.push(rule),
            Rule::OzoneEvent(rule) => self.ozone_event.push(rule),
        }
    }

    /// Rule names of one kind, in run order.
    pub fn names(&self, kind: RuleKind) -> Vec<&'static str> {
        match kind {
            RuleKind::Post => self.post.iter().map(|r| r.name()).collect(),
            RuleKind::Profile => self.profile.iter().map(|r| r.name()).collect(),
            RuleKind::Record => self.record.iter().map(|r| r.name()).collect(),
            RuleKind::RecordDelete => self.record_delete.iter().map(|r| r.name()).collect(),
            RuleKind::Identity => self.identity.iter().map(|r| r.name()).collect(),
            RuleKind::Account => self.account.iter().map(|r| r.name()).collect(),
            RuleKind::OzoneEvent => self.ozone_event.iter().map(|r| r.name()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        RuleKind::ALL.iter().map(|kind| self.names(*kind).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both sets run the same rules in the same order.
    pub fn same_layout(&self, other: &RuleSet) -> bool {
        RuleKind::ALL
            .iter()
            .all(|kind| self.names(*kind) == other.names(*kind))
    }
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in RuleKind::ALL {
            map.entry(&kind.as_str(), &self.names(kind));
        }
        map.finish()
    }
}

/// Ordered rule names per kind.
///
/// ```json
/// {"post": ["bad-hashtags", "too-many-hashtags"], "ozone_event": ["harassment-protection"]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub post: Vec<String>,
    pub profile: Vec<String>,
    pub record: Vec<String>,
    pub record_delete: Vec<String>,
    pub identity: Vec<String>,
    pub account: Vec<String>,
    pub ozone_event: Vec<String>,
}

impl RulesConfig {
    /// Built-in rulesets: `default` and `none`.
    pub fn named(name: &str) -> Result<Self, ConfigError> {
        match name {
            "default" => Ok(Self {
                post: vec![
                    hashtags::BadHashtagsRule::NAME.to_string(),
                    hashtags::TooManyHashtagsRule::NAME.to_string(),
                    harassment::HarassmentTargetInteractionRule::NAME.to_string(),
                    harassment::HarassmentTrivialRule::NAME.to_string(),
                ],
                ozone_event: vec![harassment::HarassmentProtectionRule::NAME.to_string()],
                ..Default::default()
            }),
            "none" => Ok(Self::default()),
            other => Err(ConfigError::UnknownRuleset {
                name: other.to_string(),
            }),
        }
    }

    pub async fn load_json_file(path: &str) -> Result<Self, StoreError> {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|err| StoreError::RulesLoadFailed {
                    path: path.to_string(),
                    details: err.to_string(),
                })?;

        serde_json::from_str(&content).map_err(|err| StoreError::RulesLoadFailed {
            path: path.to_string(),
            details: err.to_string(),
        })
    }

    pub fn names(&self, kind: RuleKind) -> &[String] {
        match kind {
            RuleKind::Post => &self.post,
            RuleKind::Profile => &self.profile,
            RuleKind::Record => &self.record,
            RuleKind::RecordDelete => &self.record_delete,
            RuleKind::Identity => &self.identity,
            RuleKind::Account => &self.account,
            RuleKind::OzoneEvent => &self.ozone_event,
        }
    }
}

/// Known rules by name.
#[derive(Default)]
pub struct RuleRegistry {
    rules: HashMap<&'static str, Rule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in rule.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Rule::Post(Arc::new(hashtags::BadHashtagsRule)));
        registry.register(Rule::Post(Arc::new(hashtags::TooManyHashtagsRule)));
        registry.register(Rule::Post(Arc::new(
            harassment::HarassmentTargetInteractionRule,
        )));
        registry.register(Rule::Post(Arc::new(harassment::HarassmentTrivialRule)));
        registry.register(Rule::OzoneEvent(Arc::new(
            harassment::HarassmentProtectionRule,
        )));
        registry
    }

    /// Adds or replaces a rule under its own name.
    pub fn register(&mut self, rule: Rule) {
        self.rules.insert(rule.name(), rule);
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    /// Arranges registered rules in the order `config` lists them.
    pub fn build(&self, config: &RulesConfig) -> Result<RuleSet, ConfigError> {
        let mut set = RuleSet::new();
        for kind in RuleKind::ALL {
            for name in config.names(kind) {
                let rule = self.get(name).ok_or_else(|| ConfigError::UnknownRule {
                    name: name.clone(),
                })?;
                if rule.kind() != kind {
                    return Err(ConfigError::RuleKindMismatch {
                        name: name.clone(),
                        kind: kind.to_string(),
                    });
                }
                set.push(rule.clone());
            }
        }
        Ok(set)
    }
}
