//! Harassment heuristics aimed at new accounts.

use async_trait::async_trait;
use chrono::Duration;
use tracing::{info, warn};

use super::helpers::{
    aturi_authority, dedupe_strings, extract_mentions, is_self_thread, is_valid_did,
};
use super::records::Post;
use super::{OzoneEventRule, PostRule};
use crate::constants::{
    CHANNEL_SLACK, COUNTER_TRIVIAL_HARASSING, FLAG_HARASSMENT_PROTECTION, LABEL_HIDE,
    NEW_ACCOUNT_WINDOW_DAYS, OZONE_EVENT_TAG, SET_HARASSMENT_TARGET_DIDS,
    TAG_HARASSMENT_PROTECTION,
};
use crate::context::{BaseContext, OzoneEventContext, RecordContext};
use crate::counters::Period;
use crate::effects::ReportReason;
use crate::errors::EngineError;
use crate::sets::Normalization;

const TRIVIAL_HARASSMENT_DAILY_LIMIT: i64 = 5;

/// Whether the subject is known to be younger than the new-account window.
/// Unknown age is never "new".
fn is_new_account(ctx: &BaseContext) -> bool {
    ctx.account_age()
        .is_some_and(|age| age <= Duration::days(NEW_ACCOUNT_WINDOW_DAYS))
}

/// Accounts a post interacts with: mentions plus the reply parent's author
/// when replying outside a self-thread.
fn interaction_dids(did: &str, post: &Post) -> Vec<String> {
    let mut dids = extract_mentions(post);
    if let Some(reply) = &post.reply
        && !is_self_thread(did, post)
        && let Some(parent_author) = aturi_authority(&reply.parent.uri)
    {
        dids.push(parent_author);
    }
    dedupe_strings(dids)
}

async fn is_protected_target(ctx: &BaseContext, target: &str) -> bool {
    if ctx.in_set(SET_HARASSMENT_TARGET_DIDS, target, Normalization::Exact) {
        return true;
    }
    match ctx.account_meta(target).await {
        Ok(meta) => meta
            .private
            .as_ref()
            .is_some_and(|private| private.has_tag(TAG_HARASSMENT_PROTECTION)),
        Err(EngineError::NotFound { .. }) => false,
        Err(err) => {
            warn!(target = %target, error = ?err, "Could not check target protection");
            false
        }
    }
}

/// Reports new accounts that reach out to frequently harassed accounts.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarassmentTargetInteractionRule;

impl HarassmentTargetInteractionRule {
    pub const NAME: &'static str = "harassment-target-interaction";
}

#[async_trait]
impl PostRule for HarassmentTargetInteractionRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn check(&self, ctx: &mut RecordContext, post: &Post) -> anyhow::Result<()> {
        if !is_new_account(ctx) {
            return Ok(());
        }

        let author = ctx.did().to_string();
        for target in interaction_dids(&author, post) {
            if !is_valid_did(&target) {
                warn!(did = %target, "Invalid DID in record");
                continue;
            }
            if target == author || !is_protected_target(ctx, &target).await {
                continue;
            }

            // Protected targets that follow the author are talking to a friend.
            let relationship = ctx.relationship(&target).await?;
            if relationship.followed_by {
                continue;
            }

            ctx.report_account(
                ReportReason::Other,
                &format!(
                    "possible harassment of known target account: {} (also labeled; remove label if this isn't harassment)",
                    target
                ),
            );
            ctx.add_account_label(LABEL_HIDE);
            ctx.notify(CHANNEL_SLACK);
            return Ok(());
        }
        Ok(())
    }
}

/// Escalates new accounts repeatedly posting a bare "F".
#[derive(Debug, Clone, Copy, Default)]
pub struct HarassmentTrivialRule;

impl HarassmentTrivialRule {
    pub const NAME: &'static str = "harassment-trivial";
}

#[async_trait]
impl PostRule for HarassmentTrivialRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn check(&self, ctx: &mut RecordContext, post: &Post) -> anyhow::Result<()> {
        if !is_new_account(ctx) || post.text != "F" {
            return Ok(());
        }

        let did = ctx.did().to_string();
        ctx.increment(COUNTER_TRIVIAL_HARASSING, &did);
        let count = ctx
            .get_count(COUNTER_TRIVIAL_HARASSING, &did, Period::Day)
            .await?;

        if count > TRIVIAL_HARASSMENT_DAILY_LIMIT {
            ctx.report_account(
                ReportReason::Other,
                "possible targetted harassment (also labeled; remove label if this isn't harassment!)",
            );
            ctx.add_account_label(LABEL_HIDE);
            ctx.notify(CHANNEL_SLACK);
        }
        Ok(())
    }
}

/// Surfaces moderators granting harassment protection to an account.
#[derive(Debug, Clone, Copy, Default)]
pub struct HarassmentProtectionRule;

impl HarassmentProtectionRule {
    pub const NAME: &'static str = "harassment-protection";
}

#[async_trait]
impl OzoneEventRule for HarassmentProtectionRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn check(&self, ctx: &mut OzoneEventContext) -> anyhow::Result<()> {
        if ctx.event.event_type != OZONE_EVENT_TAG {
            return Ok(());
        }

        if ctx
            .event
            .add_tags
            .iter()
            .any(|tag| tag == TAG_HARASSMENT_PROTECTION)
        {
            info!(
                did = %ctx.did(),
                handle = ?ctx.account.identity.handle,
                ozone_comment = ?ctx.event.comment,
                "Adding harassment protection to account"
            );
            ctx.add_account_flag(FLAG_HARASSMENT_PROTECTION);
        }
        Ok(())
    }
}
