//! Repository events as seen by the moderation engine.
//!
//! Firehose messages (and moderation events pulled from Ozone) are converted
//! into [`RepoEvent`] before they enter the pipeline so the engine never has
//! to know which transport produced them.

use atproto_jetstream::JetstreamEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single record write inside a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOp {
    pub collection: String,
    pub rkey: String,
    pub cid: Option<String>,
    pub record: serde_json::Value,
}

/// An action taken by a human moderator in Ozone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OzoneEvent {
    pub id: i64,
    /// Short event type, e.g. `tag`, `label`, `takedown`
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub subject_did: String,
    pub subject_uri: Option<String>,
    pub comment: Option<String>,
    #[serde(default)]
    pub add_tags: Vec<String>,
    #[serde(default)]
    pub remove_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    RecordCreate(RecordOp),
    RecordUpdate(RecordOp),
    RecordDelete { collection: String, rkey: String },
    IdentityChange,
    AccountChange,
    OzoneModerationEvent(OzoneEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepoEvent {
    /// Stream sequence number; never reordered for a given subject.
    pub seq: i64,
    /// Subject account
    pub did: String,
    pub rev: Option<String>,
    /// Previous revision the commit builds on; `None` for genesis commits.
    pub since: Option<String>,
    /// Commit payload was too large to be delivered inline.
    pub too_big: bool,
    pub kind: EventKind,
}

impl RepoEvent {
    pub fn new(seq: i64, did: impl Into<String>, kind: EventKind) -> Self {
        Self {
            seq,
            did: did.into(),
            rev: None,
            since: None,
            too_big: false,
            kind,
        }
    }

    /// Converts a jetstream message. Returns `None` for operations the engine
    /// does not understand.
    ///
    /// Jetstream inlines every record and carries neither a too-big marker
    /// nor a `since` revision, so converted events always have
    /// `too_big == false` and `since == None`. Snapshot replay only runs for
    /// events built by a source that sets those fields.
    pub fn from_jetstream(event: JetstreamEvent) -> Option<Self> {
        match event {
            JetstreamEvent::Commit {
                did,
                time_us,
                commit,
                ..
            } => {
                let op = RecordOp {
                    collection: commit.collection,
                    rkey: commit.rkey,
                    cid: Some(commit.cid).filter(|cid| !cid.is_empty()),
                    record: commit.record,
                };
                let kind = match commit.operation.as_str() {
                    "create" => EventKind::RecordCreate(op),
                    "update" => EventKind::RecordUpdate(op),
                    other => {
                        tracing::trace!(did = %did, operation = %other, "Ignoring unknown commit operation");
                        return None;
                    }
                };
                Some(Self {
                    seq: time_us as i64,
                    did,
                    rev: Some(commit.rev).filter(|rev| !rev.is_empty()),
                    since: None,
                    too_big: false,
                    kind,
                })
            }
            JetstreamEvent::Delete {
                did,
                time_us,
                commit,
                ..
            } => Some(Self {
                seq: time_us as i64,
                did,
                rev: Some(commit.rev).filter(|rev| !rev.is_empty()),
                since: None,
                too_big: false,
                kind: EventKind::RecordDelete {
                    collection: commit.collection,
                    rkey: commit.rkey,
                },
            }),
            JetstreamEvent::Identity { did, time_us, .. } => {
                Some(Self::new(time_us as i64, did, EventKind::IdentityChange))
            }
            JetstreamEvent::Account { did, time_us, .. } => {
                Some(Self::new(time_us as i64, did, EventKind::AccountChange))
            }
        }
    }

    /// Repository path (`collection/rkey`) for record events.
    pub fn path(&self) -> Option<String> {
        match &self.kind {
            EventKind::RecordCreate(op) | EventKind::RecordUpdate(op) => {
                Some(format!("{}/{}", op.collection, op.rkey))
            }
            EventKind::RecordDelete { collection, rkey } => Some(format!("{collection}/{rkey}")),
            _ => None,
        }
    }

    /// AT-URI of the record this event touches.
    pub fn record_uri(&self) -> Option<String> {
        self.path().map(|path| format!("at://{}/{}", self.did, path))
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::RecordCreate(_) => "record-create",
            EventKind::RecordUpdate(_) => "record-update",
            EventKind::RecordDelete { .. } => "record-delete",
            EventKind::IdentityChange => "identity",
            EventKind::AccountChange => "account",
            EventKind::OzoneModerationEvent(_) => "ozone-event",
        }
    }
}
