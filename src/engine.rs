//! Rule dispatch for a single event.
//!
//! [`Engine::process_event`] builds the evaluation context for an event,
//! runs every rule registered for the event's kind in configured order and
//! hands the proposed effects to the [`EffectApplier`]. Nothing that goes
//! wrong inside one event, one rule or one effect escapes this module: the
//! failure is logged with the sequence number and subject and the stream
//! moves on.

use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::account::{AccountMeta, Identity};
use crate::constants::{COLLECTION_POST, COLLECTION_PROFILE};
use crate::context::{
    AccountContext, BaseContext, EvalServices, IdentityContext, OzoneEventContext, RecordAction,
    RecordContext,
};
use crate::effects::{EffectApplier, FlushReport};
use crate::errors::EngineError;
use crate::event::{EventKind, OzoneEvent, RecordOp, RepoEvent};
use crate::metrics::{MetricTimer, names};
use crate::repo_fetch::{RepoFetcher, replay_repo_snapshot};
use crate::rules::records::{Post, Profile};
use crate::rules::{RuleRegistry, RuleSet, RulesConfig};
use crate::sets::SetStore;

/// What happened to one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    /// Evaluation passes run; more than one for replayed snapshots
    pub passes: usize,
    pub rule_failures: usize,
    /// The record could not be decoded for its collection's rules
    pub malformed: bool,
    /// The event was not evaluated at all
    pub dropped: bool,
    pub flush: FlushReport,
}

impl EventOutcome {
    fn dropped() -> Self {
        Self {
            dropped: true,
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: EventOutcome) {
        self.passes += other.passes;
        self.rule_failures += other.rule_failures;
        self.malformed |= other.malformed;
        self.dropped |= other.dropped;
        self.flush.applied += other.flush.applied;
        self.flush.skipped += other.flush.skipped;
        self.flush.failed += other.flush.failed;
        self.flush.notified += other.flush.notified;
    }
}

fn panic_details(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "rule panicked".to_string()
    }
}

pub struct Engine {
    services: Arc<EvalServices>,
    rules: RwLock<Arc<RuleSet>>,
    applier: Arc<EffectApplier>,
    repo_fetcher: Option<Arc<dyn RepoFetcher>>,
}

impl Engine {
    pub fn new(services: Arc<EvalServices>, rules: RuleSet, applier: Arc<EffectApplier>) -> Self {
        Self {
            services,
            rules: RwLock::new(Arc::new(rules)),
            applier,
            repo_fetcher: None,
        }
    }

    /// Enables snapshot replay for too-big commits.
    pub fn with_repo_fetcher(mut self, fetcher: Arc<dyn RepoFetcher>) -> Self {
        self.repo_fetcher = Some(fetcher);
        self
    }

    pub fn services(&self) -> &Arc<EvalServices> {
        &self.services
    }

    /// Current rule set. Events already in evaluation keep the set they
    /// started with.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    pub fn reload_rules(&self, rules: RuleSet) {
        info!(rules = ?rules, "Rule set replaced");
        *self.rules.write() = Arc::new(rules);
    }

    pub async fn process_event(&self, event: RepoEvent) -> EventOutcome {
        let kind = event.kind_name();
        let timer = MetricTimer::new(names::EVALUATION_DURATION, self.services.metrics.clone());

        let outcome = if event.too_big {
            self.replay_too_big(event).await
        } else {
            self.evaluate(event).await
        };

        timer.record(kind).await;
        self.services
            .metrics
            .incr_with_tags(names::EVENTS_PROCESSED, &[("kind", kind)])
            .await;
        if outcome.dropped {
            self.services
                .metrics
                .incr_with_tags(names::EVENTS_DROPPED, &[("kind", kind)])
                .await;
        }
        outcome
    }

    async fn replay_too_big(&self, event: RepoEvent) -> EventOutcome {
        if event.since.is_none() {
            error!(seq = event.seq, did = %event.did, "Dropping too-big commit without a prior revision");
            return EventOutcome::dropped();
        }
        let Some(fetcher) = &self.repo_fetcher else {
            error!(seq = event.seq, did = %event.did, "Dropping too-big commit: repository fetch not configured");
            return EventOutcome::dropped();
        };

        let account = match self.resolve_subject(event.seq, &event.did).await {
            Some(account) => account,
            None => return EventOutcome::dropped(),
        };
        let Some(pds) = account.identity.pds_endpoint.as_deref() else {
            error!(seq = event.seq, did = %event.did, "Dropping too-big commit: no PDS endpoint for account");
            return EventOutcome::dropped();
        };

        let replayed = match replay_repo_snapshot(fetcher.as_ref(), pds, &event.did, event.seq).await {
            Ok(replayed) => replayed,
            Err(err) => {
                error!(seq = event.seq, did = %event.did, error = ?err, "Dropping too-big commit");
                return EventOutcome::dropped();
            }
        };

        info!(seq = event.seq, did = %event.did, records = replayed.len(), "Replaying repository snapshot for too-big commit");
        self.services
            .metrics
            .count(names::EVENTS_REPLAYED, replayed.len() as u64)
            .await;

        let mut outcome = EventOutcome::default();
        for synthetic in replayed {
            outcome.absorb(self.evaluate(synthetic).await);
        }
        outcome
    }

    /// Resolves the subject account, degrading to a bare identity when the
    /// account cache cannot help. `None` means the event cannot be evaluated.
    async fn resolve_subject(&self, seq: i64, did: &str) -> Option<Arc<AccountMeta>> {
        match self.services.accounts.resolve(did).await {
            Ok(account) => Some(account),
            Err(err @ EngineError::Malformed { .. }) => {
                warn!(seq, did = %did, error = ?err, "Skipping event with malformed subject");
                self.services.metrics.incr(names::RECORDS_MALFORMED).await;
                None
            }
            Err(err) => {
                warn!(seq, did = %did, error = ?err, "Evaluating with bare identity");
                self.services
                    .metrics
                    .incr(names::ACCOUNT_LOOKUP_DEGRADED)
                    .await;
                Some(Arc::new(AccountMeta {
                    identity: Identity::new(did),
                    public: None,
                    private: None,
                }))
            }
        }
    }

    async fn evaluate(&self, event: RepoEvent) -> EventOutcome {
        let RepoEvent { seq, did, kind, .. } = event;

        // Moderator actions and account changes make cached facts stale.
        if matches!(
            kind,
            EventKind::IdentityChange
                | EventKind::AccountChange
                | EventKind::OzoneModerationEvent(_)
        ) {
            self.services.accounts.invalidate(&did).await;
        }

        let Some(account) = self.resolve_subject(seq, &did).await else {
            return EventOutcome::dropped();
        };
        let rules = self.rules();
        let base = BaseContext::new(self.services.clone(), seq, account);
        let span = base.span.clone();

        async move {
            let mut outcome = EventOutcome {
                passes: 1,
                ..Default::default()
            };
            let base = match kind {
                EventKind::RecordCreate(op) => {
                    self.run_record_rules(&rules, base, RecordAction::Create, op, &mut outcome)
                        .await
                }
                EventKind::RecordUpdate(op) => {
                    self.run_record_rules(&rules, base, RecordAction::Update, op, &mut outcome)
                        .await
                }
                EventKind::RecordDelete { collection, rkey } => {
                    let mut ctx = RecordContext::new(
                        base,
                        RecordAction::Delete,
                        collection,
                        rkey,
                        None,
                        serde_json::Value::Null,
                    );
                    for rule in &rules.record_delete {
                        self.run_rule(rule.name(), &mut outcome, rule.check(&mut ctx))
                            .await;
                    }
                    ctx.into_base()
                }
                EventKind::IdentityChange => {
                    let mut ctx = IdentityContext::new(base);
                    for rule in &rules.identity {
                        self.run_rule(rule.name(), &mut outcome, rule.check(&mut ctx))
                            .await;
                    }
                    ctx.into_base()
                }
                EventKind::AccountChange => {
                    let mut ctx = AccountContext::new(base);
                    for rule in &rules.account {
                        self.run_rule(rule.name(), &mut outcome, rule.check(&mut ctx))
                            .await;
                    }
                    ctx.into_base()
                }
                EventKind::OzoneModerationEvent(event) => {
                    self.run_ozone_rules(&rules, base, event, &mut outcome).await
                }
            };

            let batch = base.into_batch().await;
            if !batch.effects.is_empty() {
                debug!(seq, effects = batch.effects.len(), "Flushing effects");
                outcome.flush = self.applier.flush(batch).await;
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run_record_rules(
        &self,
        rules: &RuleSet,
        base: BaseContext,
        action: RecordAction,
        op: RecordOp,
        outcome: &mut EventOutcome,
    ) -> BaseContext {
        let RecordOp {
            collection,
            rkey,
            cid,
            record,
        } = op;
        let mut ctx = RecordContext::new(base, action, collection, rkey, cid, record);

        match ctx.collection.as_str() {
            COLLECTION_POST => match Post::from_value(&ctx.record) {
                Ok(post) => {
                    for rule in &rules.post {
                        self.run_rule(rule.name(), outcome, rule.check(&mut ctx, &post))
                            .await;
                    }
                }
                Err(err) => self.record_malformed(&ctx, err, outcome).await,
            },
            COLLECTION_PROFILE => match Profile::from_value(&ctx.record) {
                Ok(profile) => {
                    for rule in &rules.profile {
                        self.run_rule(rule.name(), outcome, rule.check(&mut ctx, &profile))
                            .await;
                    }
                }
                Err(err) => self.record_malformed(&ctx, err, outcome).await,
            },
            _ => {}
        }

        for rule in &rules.record {
            self.run_rule(rule.name(), outcome, rule.check(&mut ctx))
                .await;
        }
        ctx.into_base()
    }

    async fn run_ozone_rules(
        &self,
        rules: &RuleSet,
        base: BaseContext,
        event: OzoneEvent,
        outcome: &mut EventOutcome,
    ) -> BaseContext {
        let mut ctx = OzoneEventContext::new(base, event);
        for rule in &rules.ozone_event {
            self.run_rule(rule.name(), outcome, rule.check(&mut ctx))
                .await;
        }
        ctx.into_base()
    }

    async fn record_malformed(
        &self,
        ctx: &RecordContext,
        err: EngineError,
        outcome: &mut EventOutcome,
    ) {
        warn!(seq = ctx.seq, did = %ctx.did(), uri = %ctx.uri(), error = ?err, "Skipping rules for malformed record");
        outcome.malformed = true;
        self.services
            .metrics
            .incr_with_tags(names::RECORDS_MALFORMED, &[("collection", ctx.collection.as_str())])
            .await;
    }

    /// Runs one rule, containing both errors and panics.
    async fn run_rule<F>(&self, rule: &'static str, outcome: &mut EventOutcome, check: F)
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        let details = match AssertUnwindSafe(check).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{:#}", err),
            Err(panic) => panic_details(&*panic),
        };

        let failure = EngineError::RuleFailure {
            rule: rule.to_string(),
            details,
        };
        error!(rule, error = %failure, "Rule failed");
        outcome.rule_failures += 1;
        self.services
            .metrics
            .incr_with_tags(names::RULE_FAILURES, &[("rule", rule)])
            .await;
    }
}

/// Where rules and sets are reloaded from.
#[derive(Clone, Debug)]
pub struct PolicySource {
    /// Built-in ruleset name, used when no rules file is configured
    pub ruleset: String,
    pub rules_config_path: Option<String>,
    pub sets_json_path: Option<String>,
}

impl PolicySource {
    pub async fn rules_config(&self) -> anyhow::Result<RulesConfig> {
        match &self.rules_config_path {
            Some(path) => Ok(RulesConfig::load_json_file(path).await?),
            None => Ok(RulesConfig::named(&self.ruleset)?),
        }
    }
}

/// Re-reads rules and sets on an interval. A failed reload keeps whatever
/// is currently loaded.
pub struct PolicyReloader {
    engine: Arc<Engine>,
    registry: RuleRegistry,
    sets: Arc<SetStore>,
    source: PolicySource,
    interval: Duration,
}

impl PolicyReloader {
    pub fn new(
        engine: Arc<Engine>,
        registry: RuleRegistry,
        sets: Arc<SetStore>,
        source: PolicySource,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            registry,
            sets,
            source,
            interval,
        }
    }

    pub async fn reload_once(&self) {
        if let Some(path) = &self.source.sets_json_path {
            // Failure already logged by the set store.
            let _ = self.sets.reload_from(path).await;
        }

        let rules = match self.source.rules_config().await {
            Ok(config) => self.registry.build(&config).map_err(anyhow::Error::from),
            Err(err) => Err(err),
        };
        match rules {
            Ok(rules) => {
                if !rules.same_layout(&self.engine.rules()) {
                    self.engine.reload_rules(rules);
                }
            }
            Err(err) => {
                warn!(error = ?err, "Keeping previous rule set");
            }
        }
    }

    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; policy was loaded at startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                _ = ticker.tick() => self.reload_once().await,
            }
        }
    }
}
