//! Typed views of the record kinds rules inspect.
//!
//! Only the fields rules read are modelled; unknown fields are ignored so
//! lexicon additions never make a record unparseable.

use serde::Deserialize;
use serde_json::Value;

use crate::errors::EngineError;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReplyRef {
    pub parent: StrongRef,
    pub root: StrongRef,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#mention")]
    Mention { did: String },
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
    #[serde(rename = "app.bsky.richtext.facet#tag")]
    Tag { tag: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Facet {
    pub index: ByteSlice,
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

/// `app.bsky.feed.post`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub facets: Vec<Facet>,
    pub reply: Option<ReplyRef>,
    pub embed: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub langs: Vec<String>,
    pub created_at: Option<String>,
}

impl Post {
    pub fn from_value(record: &Value) -> Result<Self, EngineError> {
        Post::deserialize(record)
            .map_err(|err| EngineError::malformed(format!("invalid post record: {}", err)))
    }

    /// Whether the post embeds images directly.
    pub fn has_image_embed(&self) -> bool {
        self.embed
            .as_ref()
            .and_then(|embed| embed["$type"].as_str())
            .is_some_and(|t| t == "app.bsky.embed.images")
    }
}

/// `app.bsky.actor.profile`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: Option<String>,
    pub description: Option<String>,
}

impl Profile {
    pub fn from_value(record: &Value) -> Result<Self, EngineError> {
        Profile::deserialize(record)
            .map_err(|err| EngineError::malformed(format!("invalid profile record: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_parsing() {
        let post = Post::from_value(&json!({
            "$type": "app.bsky.feed.post",
            "text": "hi @bob #rust",
            "createdAt": "2024-05-01T00:00:00Z",
            "facets": [
                {
                    "index": {"byteStart": 3, "byteEnd": 7},
                    "features": [{"$type": "app.bsky.richtext.facet#mention", "did": "did:plc:bob"}]
                },
                {
                    "index": {"byteStart": 8, "byteEnd": 13},
                    "features": [{"$type": "app.bsky.richtext.facet#tag", "tag": "rust"}]
                },
                {
                    "index": {"byteStart": 0, "byteEnd": 1},
                    "features": [{"$type": "app.bsky.richtext.facet#future", "x": 1}]
                }
            ],
            "embed": {"$type": "app.bsky.embed.images", "images": []}
        }))
        .unwrap();

        assert_eq!(post.text, "hi @bob #rust");
        assert_eq!(post.facets.len(), 3);
        assert_eq!(
            post.facets[0].features[0],
            FacetFeature::Mention {
                did: "did:plc:bob".to_string()
            }
        );
        assert_eq!(post.facets[2].features[0], FacetFeature::Unknown);
        assert!(post.has_image_embed());
    }

    #[test]
    fn test_malformed_post() {
        let result = Post::from_value(&json!({"text": 42}));
        assert!(matches!(result, Err(EngineError::Malformed { .. })));
    }

    #[test]
    fn test_profile_parsing() {
        let profile = Profile::from_value(&json!({"displayName": "Alice"})).unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert!(profile.description.is_none());
    }
}
