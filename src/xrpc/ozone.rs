//! Ozone moderation service client.
//!
//! Supplies private account facts (`getRepo`), applies moderation actions
//! (`emitEvent`) and lists moderator actions for the poller (`queryEvents`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::XrpcClient;
use crate::account::{AccountPrivate, PrivateAccountSource};
use crate::effects::{ModerationBackend, ReportReason};
use crate::errors::XrpcError;
use crate::event::OzoneEvent;

const GET_REPO: &str = "tools.ozone.moderation.getRepo";
const EMIT_EVENT: &str = "tools.ozone.moderation.emitEvent";
const QUERY_EVENTS: &str = "tools.ozone.moderation.queryEvents";

const EVENT_TYPE_PREFIX: &str = "tools.ozone.moderation.defs#modEvent";

const AUTOMOD_COMMENT: &str = "[skywarden]: automated moderation action";

#[derive(Deserialize)]
struct LabelView {
    val: String,
    #[serde(default)]
    neg: bool,
}

#[derive(Deserialize, Default)]
struct SubjectStatus {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    takendown: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Moderation {
    subject_status: Option<SubjectStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoViewDetail {
    indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    moderation: Moderation,
    #[serde(default)]
    labels: Vec<LabelView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModEventView {
    id: i64,
    event: Value,
    subject: Value,
    created_by: String,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct QueryEventsResponse {
    #[serde(default)]
    events: Vec<ModEventView>,
    cursor: Option<String>,
}

/// One page of moderation events.
#[derive(Debug, Default)]
pub struct OzoneEventPage {
    pub events: Vec<OzoneEvent>,
    pub cursor: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OzoneClient {
    client: XrpcClient,
    /// DID recorded as the author of emitted events
    moderator_did: String,
}

impl OzoneClient {
    pub fn new(client: XrpcClient, moderator_did: &str) -> Self {
        Self {
            client,
            moderator_did: moderator_did.to_string(),
        }
    }

    async fn emit(&self, did: &str, event: Value) -> Result<(), XrpcError> {
        let body = json!({
            "event": event,
            "subject": {
                "$type": "com.atproto.admin.defs#repoRef",
                "did": did,
            },
            "createdBy": self.moderator_did,
        });
        let _: Value = self.client.procedure(EMIT_EVENT, &body).await?;
        Ok(())
    }

    /// Moderation events created after `created_after`, oldest first.
    pub async fn query_events(
        &self,
        created_after: DateTime<Utc>,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<OzoneEventPage, XrpcError> {
        let mut params = vec![
            ("sortDirection", "asc".to_string()),
            (
                "createdAfter",
                created_after.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }

        let response: QueryEventsResponse = self.client.query(QUERY_EVENTS, &params).await?;

        Ok(OzoneEventPage {
            events: response
                .events
                .into_iter()
                .filter_map(ozone_event_from_view)
                .collect(),
            cursor: response.cursor,
        })
    }
}

/// `tools.ozone.moderation.defs#modEventTag` becomes `tag`.
pub fn short_event_type(type_name: &str) -> Option<String> {
    let rest = type_name.strip_prefix(EVENT_TYPE_PREFIX)?;
    let mut chars = rest.chars();
    let first = chars.next()?;
    Some(first.to_lowercase().chain(chars).collect())
}

fn string_list(value: &Value, field: &str) -> Vec<String> {
    value[field]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn ozone_event_from_view(view: ModEventView) -> Option<OzoneEvent> {
    let event_type = view.event["$type"].as_str().and_then(short_event_type)?;

    // Repo subjects carry the DID; record subjects carry a strongRef URI.
    let subject_uri = view.subject["uri"].as_str().map(str::to_string);
    let subject_did = match view.subject["did"].as_str() {
        Some(did) => did.to_string(),
        None => subject_uri
            .as_deref()?
            .strip_prefix("at://")?
            .split('/')
            .next()?
            .to_string(),
    };

    Some(OzoneEvent {
        id: view.id,
        event_type,
        created_at: view.created_at,
        created_by: view.created_by,
        subject_did,
        subject_uri,
        comment: view.event["comment"].as_str().map(str::to_string),
        add_tags: string_list(&view.event, "add"),
        remove_tags: string_list(&view.event, "remove"),
    })
}

#[async_trait]
impl PrivateAccountSource for OzoneClient {
    async fn private_facts(&self, did: &str) -> Result<AccountPrivate, XrpcError> {
        let repo: RepoViewDetail = self
            .client
            .query(GET_REPO, &[("did", did.to_string())])
            .await?;

        let status = repo.moderation.subject_status.unwrap_or_default();
        Ok(AccountPrivate {
            indexed_at: repo.indexed_at,
            account_tags: status.tags,
            labels: repo
                .labels
                .into_iter()
                .filter(|label| !label.neg)
                .map(|label| label.val)
                .collect(),
            takendown: status.takendown,
        })
    }
}

#[async_trait]
impl ModerationBackend for OzoneClient {
    async fn add_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.emit(
            did,
            json!({
                "$type": "tools.ozone.moderation.defs#modEventLabel",
                "createLabelVals": [label],
                "negateLabelVals": [],
                "comment": AUTOMOD_COMMENT,
            }),
        )
        .await
    }

    async fn remove_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.emit(
            did,
            json!({
                "$type": "tools.ozone.moderation.defs#modEventLabel",
                "createLabelVals": [],
                "negateLabelVals": [label],
                "comment": AUTOMOD_COMMENT,
            }),
        )
        .await
    }

    async fn add_account_tag(&self, did: &str, tag: &str) -> Result<(), XrpcError> {
        self.emit(
            did,
            json!({
                "$type": "tools.ozone.moderation.defs#modEventTag",
                "add": [tag],
                "remove": [],
                "comment": AUTOMOD_COMMENT,
            }),
        )
        .await
    }

    async fn report_account(
        &self,
        did: &str,
        reason: ReportReason,
        comment: &str,
    ) -> Result<(), XrpcError> {
        self.emit(
            did,
            json!({
                "$type": "tools.ozone.moderation.defs#modEventReport",
                "reportType": reason.as_lexicon(),
                "comment": comment,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ozone(server: &MockServer) -> OzoneClient {
        OzoneClient::new(
            XrpcClient::new(reqwest::Client::new(), &server.uri(), Duration::from_secs(1))
                .with_basic_auth("admin", "secret"),
            "did:plc:moderator",
        )
    }

    #[test]
    fn test_short_event_type() {
        assert_eq!(
            short_event_type("tools.ozone.moderation.defs#modEventTag").as_deref(),
            Some("tag")
        );
        assert_eq!(
            short_event_type("tools.ozone.moderation.defs#modEventTakedown").as_deref(),
            Some("takedown")
        );
        assert_eq!(short_event_type("app.bsky.feed.post"), None);
    }

    #[tokio::test]
    async fn test_private_facts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.getRepo"))
            .and(query_param("did", "did:plc:abc"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "did": "did:plc:abc",
                "handle": "alice.test",
                "indexedAt": "2024-05-01T00:00:00.000Z",
                "moderation": {
                    "subjectStatus": {
                        "tags": ["harassment-protection"],
                        "takendown": false
                    }
                },
                "labels": [
                    {"val": "!hide", "src": "did:plc:moderator", "uri": "at://did:plc:abc", "cts": "2024-05-01T00:00:00.000Z"},
                    {"val": "spam", "neg": true, "src": "did:plc:moderator", "uri": "at://did:plc:abc", "cts": "2024-05-01T00:00:00.000Z"}
                ]
            })))
            .mount(&server)
            .await;

        let private = ozone(&server).private_facts("did:plc:abc").await.unwrap();
        assert!(private.has_tag("harassment-protection"));
        assert_eq!(private.labels, vec!["!hide".to_string()]);
        assert!(private.indexed_at.is_some());
    }

    #[tokio::test]
    async fn test_report_emits_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/tools.ozone.moderation.emitEvent"))
            .and(body_partial_json(json!({
                "event": {
                    "$type": "tools.ozone.moderation.defs#modEventReport",
                    "reportType": "com.atproto.moderation.defs#reasonOther"
                },
                "subject": {"did": "did:plc:abc"},
                "createdBy": "did:plc:moderator"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
            .expect(1)
            .mount(&server)
            .await;

        ozone(&server)
            .report_account("did:plc:abc", ReportReason::Other, "test")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_label_emits_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xrpc/tools.ozone.moderation.emitEvent"))
            .and(body_partial_json(json!({
                "event": {"createLabelVals": ["!hide"]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 2})))
            .expect(1)
            .mount(&server)
            .await;

        ozone(&server)
            .add_account_label("did:plc:abc", "!hide")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_query_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.queryEvents"))
            .and(query_param("sortDirection", "asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "cursor": "next",
                "events": [
                    {
                        "id": 10,
                        "event": {
                            "$type": "tools.ozone.moderation.defs#modEventTag",
                            "add": ["harassment-protection"],
                            "remove": []
                        },
                        "subject": {"$type": "com.atproto.admin.defs#repoRef", "did": "did:plc:abc"},
                        "subjectBlobCids": [],
                        "createdBy": "did:plc:moderator",
                        "createdAt": "2024-05-01T00:00:00.000Z"
                    },
                    {
                        "id": 11,
                        "event": {"$type": "tools.ozone.moderation.defs#modEventComment", "comment": "hi"},
                        "subject": {"$type": "com.atproto.repo.strongRef", "uri": "at://did:plc:xyz/app.bsky.feed.post/1", "cid": "bafy"},
                        "subjectBlobCids": [],
                        "createdBy": "did:plc:moderator",
                        "createdAt": "2024-05-01T00:00:01.000Z"
                    }
                ]
            })))
            .mount(&server)
            .await;

        let page = ozone(&server)
            .query_events(Utc::now(), None, 50)
            .await
            .unwrap();

        assert_eq!(page.cursor.as_deref(), Some("next"));
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].event_type, "tag");
        assert_eq!(page.events[0].add_tags, vec!["harassment-protection".to_string()]);
        assert_eq!(page.events[1].event_type, "comment");
        assert_eq!(page.events[1].subject_did, "did:plc:xyz");
        assert_eq!(page.events[1].comment.as_deref(), Some("hi"));
    }
}
