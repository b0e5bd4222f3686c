//! Application-wide constants

/// Collections that carry moderation-relevant records
pub(crate) const COLLECTION_POST: &str = "app.bsky.feed.post";
pub(crate) const COLLECTION_PROFILE: &str = "app.bsky.actor.profile";

pub(crate) const DEFAULT_COLLECTIONS: &[&str] = &[COLLECTION_POST, COLLECTION_PROFILE];

/// Named sets consulted by the reference rules
pub(crate) const SET_HARASSMENT_TARGET_DIDS: &str = "harassment-target-dids";
pub(crate) const SET_BAD_HASHTAGS: &str = "bad-hashtags";

/// Private account tag applied by moderators to protected accounts
pub(crate) const TAG_HARASSMENT_PROTECTION: &str = "harassment-protection";

pub(crate) const LABEL_HIDE: &str = "!hide";

pub(crate) const FLAG_BAD_HASHTAG: &str = "bad-hashtag";
pub(crate) const FLAG_MANY_HASHTAGS: &str = "many-hashtags";
pub(crate) const FLAG_HARASSMENT_PROTECTION: &str = "harassment-protection";

pub(crate) const COUNTER_TRIVIAL_HARASSING: &str = "trivial-harassing";
pub(crate) const COUNTER_ACCOUNT_REPORT: &str = "automod-account-report";

pub(crate) const CHANNEL_SLACK: &str = "slack";

/// Age window for stricter scrutiny of new accounts
pub(crate) const NEW_ACCOUNT_WINDOW_DAYS: i64 = 7;

/// Index timestamps older than this are treated as bogus
pub(crate) const MAX_PLAUSIBLE_ACCOUNT_AGE_DAYS: i64 = 10 * 365;

/// Ozone moderation event type names
pub(crate) const OZONE_EVENT_TAG: &str = "tag";
