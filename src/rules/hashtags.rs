//! Hashtag rules.

use async_trait::async_trait;

use super::PostRule;
use super::helpers::{extract_hashtags, normalize_hashtag};
use super::records::Post;
use crate::constants::{FLAG_BAD_HASHTAG, FLAG_MANY_HASHTAGS, SET_BAD_HASHTAGS};
use crate::context::RecordContext;
use crate::sets::Normalization;

/// Flags posts carrying a hashtag from the `bad-hashtags` set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BadHashtagsRule;

impl BadHashtagsRule {
    pub const NAME: &'static str = "bad-hashtags";
}

#[async_trait]
impl PostRule for BadHashtagsRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn check(&self, ctx: &mut RecordContext, post: &Post) -> anyhow::Result<()> {
        for tag in extract_hashtags(post) {
            let tag = normalize_hashtag(&tag);
            if ctx.in_set(SET_BAD_HASHTAGS, &tag, Normalization::Lowercase) {
                ctx.add_record_flag(FLAG_BAD_HASHTAG);
                break;
            }
        }
        Ok(())
    }
}

/// Flags posts that are almost entirely hashtags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TooManyHashtagsRule;

impl TooManyHashtagsRule {
    pub const NAME: &'static str = "too-many-hashtags";
}

#[async_trait]
impl PostRule for TooManyHashtagsRule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn check(&self, ctx: &mut RecordContext, post: &Post) -> anyhow::Result<()> {
        let tags = extract_hashtags(post);
        let tag_chars: usize = tags.iter().map(String::len).sum();
        let ratio = tag_chars as f64 / post.text.len() as f64;

        // Images buy a little more room.
        if (tags.len() > 4 && ratio > 0.6 && !post.has_image_embed())
            || (tags.len() > 7 && ratio > 0.8)
        {
            ctx.add_record_flag(FLAG_MANY_HASHTAGS);
        }
        Ok(())
    }
}
