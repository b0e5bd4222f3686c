//! Public account facts from the AppView.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::XrpcClient;
use crate::account::{AccountPublic, AccountRelationship, PublicAccountSource};
use crate::errors::XrpcError;

const GET_PROFILE: &str = "app.bsky.actor.getProfile";
const GET_RELATIONSHIPS: &str = "app.bsky.graph.getRelationships";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileViewDetailed {
    display_name: Option<String>,
    description: Option<String>,
    #[serde(default)]
    followers_count: i64,
    #[serde(default)]
    follows_count: i64,
    #[serde(default)]
    posts_count: i64,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Relationship {
    #[serde(default)]
    did: String,
    following: Option<String>,
    followed_by: Option<String>,
}

#[derive(Deserialize)]
struct RelationshipsResponse {
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Clone, Debug)]
pub struct AppviewClient {
    client: XrpcClient,
}

impl AppviewClient {
    pub fn new(client: XrpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PublicAccountSource for AppviewClient {
    async fn profile(&self, did: &str) -> Result<AccountPublic, XrpcError> {
        let profile: ProfileViewDetailed = self
            .client
            .query(GET_PROFILE, &[("actor", did.to_string())])
            .await?;

        Ok(AccountPublic {
            display_name: profile.display_name,
            description: profile.description,
            followers_count: profile.followers_count,
            follows_count: profile.follows_count,
            posts_count: profile.posts_count,
            created_at: profile.created_at,
        })
    }

    async fn relationship(
        &self,
        actor: &str,
        other: &str,
    ) -> Result<AccountRelationship, XrpcError> {
        let response: RelationshipsResponse = self
            .client
            .query(
                GET_RELATIONSHIPS,
                &[("actor", actor.to_string()), ("others", other.to_string())],
            )
            .await?;

        // Relationship follow URIs are from the actor's point of view.
        let relationship = response
            .relationships
            .into_iter()
            .find(|r| r.did == other)
            .map(|r| AccountRelationship {
                did: other.to_string(),
                following: r.following.is_some(),
                followed_by: r.followed_by.is_some(),
            })
            .unwrap_or_else(|| AccountRelationship {
                did: other.to_string(),
                ..Default::default()
            });

        Ok(relationship)
    }
}
