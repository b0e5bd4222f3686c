use chrono::{DateTime, Utc};
use moka::future::Cache;
use ordermap::OrderMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::notify::{NotificationSink, NotificationSummary};
use super::{Effect, ModerationBackend};
use crate::account::AccountPrivate;
use crate::config::ApplyConfig;
use crate::constants::COUNTER_ACCOUNT_REPORT;
use crate::counters::{CountStore, Period, increment_dedup_key};
use crate::errors::{EngineError, XrpcError};
use crate::flags::FlagStore;
use crate::metrics::{SharedMetricsPublisher, names};

/// Effects produced by one evaluation pass, ready to apply.
#[derive(Debug, Clone)]
pub struct EffectBatch {
    pub seq: i64,
    pub did: String,
    pub handle: Option<String>,
    /// Private facts seen during evaluation, used to skip no-op writes
    pub private: Option<AccountPrivate>,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub notified: usize,
}

/// Applies effect batches against the moderation backend, flag store and
/// notification sink.
///
/// Each effect is applied independently: a failure is logged with the event
/// sequence and subject and does not stop the remaining effects.
pub struct EffectApplier {
    backend: Arc<dyn ModerationBackend>,
    notifier: Arc<dyn NotificationSink>,
    flags: Arc<dyn FlagStore>,
    counters: Arc<dyn CountStore>,
    metrics: SharedMetricsPublisher,
    config: ApplyConfig,
    applied: Cache<String, ()>,
}

impl EffectApplier {
    pub fn new(
        backend: Arc<dyn ModerationBackend>,
        notifier: Arc<dyn NotificationSink>,
        flags: Arc<dyn FlagStore>,
        counters: Arc<dyn CountStore>,
        metrics: SharedMetricsPublisher,
        config: ApplyConfig,
    ) -> Self {
        Self {
            backend,
            notifier,
            flags,
            counters,
            metrics,
            config,
            applied: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(Duration::from_secs(60 * 60))
                .build(),
        }
    }

    fn applied_key(seq: i64, did: &str, effect: &Effect) -> String {
        format!("{}:{}:{:?}", seq, did, effect.key())
    }

    async fn with_retry<F, Fut>(&self, effect: &Effect, op: F) -> Result<(), EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), XrpcError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_delay(attempt);
                    warn!(
                        effect = %effect,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = ?err,
                        "Retrying effect application"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(EngineError::ApplyFailure {
                        effect: effect.to_string(),
                        details: err.to_string(),
                    });
                }
            }
        }
    }

    async fn record_failure(&self, seq: i64, did: &str, err: &EngineError, kind: &str) {
        error!(seq, did = %did, error = ?err, "Failed to apply effect");
        self.metrics
            .incr_with_tags(names::EFFECTS_FAILED, &[("kind", kind)])
            .await;
    }

    async fn record_success(&self, seq: i64, did: &str, effect: &Effect) {
        self.applied
            .insert(Self::applied_key(seq, did, effect), ())
            .await;
        self.metrics
            .incr_with_tags(names::EFFECTS_APPLIED, &[("kind", effect.kind())])
            .await;
    }

    async fn already_reported(&self, did: &str, now: DateTime<Utc>) -> bool {
        match self
            .counters
            .get_count(COUNTER_ACCOUNT_REPORT, did, Period::Day, now)
            .await
        {
            Ok(count) => count > 0,
            Err(err) => {
                warn!(did = %did, error = ?err, "Report counter unavailable, reporting anyway");
                false
            }
        }
    }

    pub async fn flush(&self, batch: EffectBatch) -> FlushReport {
        let EffectBatch {
            seq,
            did,
            handle,
            private,
            effects,
        } = batch;

        let now = Utc::now();
        let mut report = FlushReport::default();
        let mut summary = NotificationSummary {
            did: did.clone(),
            handle,
            ..Default::default()
        };
        let mut channels: Vec<String> = Vec::new();
        let mut record_flags: OrderMap<String, Vec<String>> = OrderMap::new();
        let mut account_flags: Vec<String> = Vec::new();

        for effect in effects {
            if self
                .applied
                .contains_key(&Self::applied_key(seq, &did, &effect))
            {
                debug!(seq, did = %did, effect = %effect, "Effect already applied for this event");
                report.skipped += 1;
                continue;
            }

            let outcome = match &effect {
                Effect::RecordFlag { uri, flag } => {
                    record_flags
                        .entry(uri.clone())
                        .or_default()
                        .push(flag.clone());
                    continue;
                }
                Effect::AccountFlag(flag) => {
                    account_flags.push(flag.clone());
                    continue;
                }
                Effect::Notify { channel } => {
                    channels.push(channel.clone());
                    continue;
                }
                Effect::AccountLabel(label) => {
                    if private.as_ref().is_some_and(|p| p.has_label(label)) {
                        None
                    } else {
                        let result = self
                            .with_retry(&effect, || self.backend.add_account_label(&did, label))
                            .await;
                        if result.is_ok() {
                            summary.new_labels.push(label.clone());
                        }
                        Some(result)
                    }
                }
                Effect::RemoveAccountLabel(label) => {
                    if private.as_ref().is_some_and(|p| !p.has_label(label)) {
                        None
                    } else {
                        let result = self
                            .with_retry(&effect, || self.backend.remove_account_label(&did, label))
                            .await;
                        if result.is_ok() {
                            summary.removed_labels.push(label.clone());
                        }
                        Some(result)
                    }
                }
                Effect::AccountTag(tag) => {
                    if private.as_ref().is_some_and(|p| p.has_tag(tag)) {
                        None
                    } else {
                        let result = self
                            .with_retry(&effect, || self.backend.add_account_tag(&did, tag))
                            .await;
                        if result.is_ok() {
                            summary.new_tags.push(tag.clone());
                        }
                        Some(result)
                    }
                }
                Effect::Report { reason, comment } => {
                    if self.already_reported(&did, now).await {
                        info!(seq, did = %did, "Account already reported today, skipping report");
                        None
                    } else {
                        let result = self
                            .with_retry(&effect, || {
                                self.backend.report_account(&did, *reason, comment)
                            })
                            .await;
                        if result.is_ok() {
                            let dedup = increment_dedup_key(seq, COUNTER_ACCOUNT_REPORT, &did);
                            if let Err(err) = self
                                .counters
                                .increment_once(&dedup, COUNTER_ACCOUNT_REPORT, &did, now)
                                .await
                            {
                                warn!(did = %did, error = ?err, "Failed to record report counter");
                            }
                            summary
                                .reports
                                .push(format!("{}: {}", reason.as_str(), comment));
                        }
                        Some(result)
                    }
                }
            };

            match outcome {
                None => report.skipped += 1,
                Some(Ok(())) => {
                    self.record_success(seq, &did, &effect).await;
                    report.applied += 1;
                }
                Some(Err(err)) => {
                    self.record_failure(seq, &did, &err, effect.kind()).await;
                    report.failed += 1;
                }
            }
        }

        for (uri, flags) in record_flags {
            self.apply_flags(seq, &did, &uri, flags, true, &mut summary, &mut report)
                .await;
        }
        if !account_flags.is_empty() {
            self.apply_flags(seq, &did, &did, account_flags, false, &mut summary, &mut report)
                .await;
        }

        if summary.is_empty() {
            report.skipped += channels.len();
            return report;
        }

        let message = summary.message();
        for channel in channels {
            match self.notifier.notify(&channel, &message).await {
                Ok(()) => report.notified += 1,
                Err(err) => {
                    let err = EngineError::ApplyFailure {
                        effect: format!("notify {}", channel),
                        details: err.to_string(),
                    };
                    self.record_failure(seq, &did, &err, "notify").await;
                    report.failed += 1;
                }
            }
        }

        report
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_flags(
        &self,
        seq: i64,
        did: &str,
        subject: &str,
        flags: Vec<String>,
        record: bool,
        summary: &mut NotificationSummary,
        report: &mut FlushReport,
    ) {
        let to_effect = |flag: &String| {
            if record {
                Effect::RecordFlag {
                    uri: subject.to_string(),
                    flag: flag.clone(),
                }
            } else {
                Effect::AccountFlag(flag.clone())
            }
        };

        match self.flags.add_flags(subject, &flags).await {
            Ok(new_flags) => {
                report.skipped += flags.len() - new_flags.len();
                for flag in &flags {
                    self.record_success(seq, did, &to_effect(flag)).await;
                }
                report.applied += new_flags.len();
                summary.new_flags.extend(new_flags);
            }
            Err(err) => {
                let err = EngineError::ApplyFailure {
                    effect: format!("flags {}", flags.join(",")),
                    details: err.to_string(),
                };
                let kind = if record { "record-flag" } else { "account-flag" };
                self.record_failure(seq, did, &err, kind).await;
                report.failed += flags.len();
            }
        }
    }
}
