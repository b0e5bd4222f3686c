//! Pure helpers shared by rules.

use atproto_record::aturi::ATURI;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::str::FromStr;

use super::records::{FacetFeature, Post};
use crate::account::AccountPrivate;
use crate::constants::MAX_PLAUSIBLE_ACCOUNT_AGE_DAYS;

static DID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").expect("valid DID regex")
});

static TID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$")
        .expect("valid TID regex")
});

/// A rich-text facet reduced to what rules look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFacet {
    /// Facet text, `None` when the byte range does not fall on the text
    pub text: Option<String>,
    pub did: Option<String>,
    pub url: Option<String>,
    pub tag: Option<String>,
}

pub fn extract_facets(post: &Post) -> Vec<PostFacet> {
    let mut out = Vec::new();
    for facet in &post.facets {
        let text = post
            .text
            .get(facet.index.byte_start..facet.index.byte_end)
            .map(str::to_string);
        for feature in &facet.features {
            let mut extracted = PostFacet {
                text: text.clone(),
                did: None,
                url: None,
                tag: None,
            };
            match feature {
                FacetFeature::Mention { did } => extracted.did = Some(did.clone()),
                FacetFeature::Link { uri } => extracted.url = Some(uri.clone()),
                FacetFeature::Tag { tag } => extracted.tag = Some(tag.clone()),
                FacetFeature::Unknown => continue,
            }
            out.push(extracted);
        }
    }
    out
}

/// DIDs mentioned through rich-text facets.
pub fn extract_mentions(post: &Post) -> Vec<String> {
    extract_facets(post)
        .into_iter()
        .filter_map(|facet| facet.did)
        .collect()
}

/// Hashtags from the post's `tags` field and from tag facets, de-duplicated.
pub fn extract_hashtags(post: &Post) -> Vec<String> {
    let mut tags = post.tags.clone();
    tags.extend(extract_facets(post).into_iter().filter_map(|facet| facet.tag));
    dedupe_strings(tags)
}

pub fn normalize_hashtag(tag: &str) -> String {
    tag.trim_start_matches(['#', '＃']).to_lowercase()
}

/// Removes repeats, keeping first-seen order.
pub fn dedupe_strings(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

pub fn aturi_authority(uri: &str) -> Option<String> {
    ATURI::from_str(uri).ok().map(|parsed| parsed.authority)
}

/// A reply whose parent and thread root are both authored by `did`.
pub fn is_self_thread(did: &str, post: &Post) -> bool {
    let Some(reply) = &post.reply else {
        return false;
    };
    let parent = aturi_authority(&reply.parent.uri);
    let root = aturi_authority(&reply.root.uri);
    parent.as_deref() == Some(did) && root.as_deref() == Some(did)
}

pub fn is_valid_did(did: &str) -> bool {
    did.len() <= 2048 && DID_REGEX.is_match(did)
}

pub fn is_tid(rkey: &str) -> bool {
    TID_REGEX.is_match(rkey)
}

/// Age of the account by its first-index time.
///
/// Returns `None` when the timestamp is missing, in the future or older
/// than any real account could be, so broken timestamps never read as an
/// extreme age.
pub fn account_age(private: &AccountPrivate, now: DateTime<Utc>) -> Option<Duration> {
    let indexed_at = private.indexed_at?;
    let age = now - indexed_at;
    if age < Duration::zero() || age >= Duration::days(MAX_PLAUSIBLE_ACCOUNT_AGE_DAYS) {
        return None;
    }
    Some(age)
}
