//! Out-of-band repository reads for commits too large to deliver inline.
//!
//! A too-big commit carries no records, so the subject's moderation-relevant
//! collections are listed from their PDS and replayed as synthetic
//! [`EventKind::RecordCreate`] events sharing the commit's sequence number.

use async_trait::async_trait;
use atproto_record::aturi::ATURI;
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::constants::{COLLECTION_POST, COLLECTION_PROFILE};
use crate::errors::{ConsumerError, XrpcError};
use crate::event::{EventKind, RecordOp, RepoEvent};
use crate::rules::helpers::is_tid;

/// Upper bound on pages read per collection.
const MAX_PAGES_PER_COLLECTION: usize = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListedRecord {
    pub uri: String,
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListRecordsPage {
    #[serde(default)]
    pub records: Vec<ListedRecord>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn list_records(
        &self,
        pds: &str,
        did: &str,
        collection: &str,
        cursor: Option<&str>,
    ) -> Result<ListRecordsPage, XrpcError>;
}

/// Converts one listed record into a synthetic create, or `None` when the
/// record is not one rules should see.
fn snapshot_event(did: &str, seq: i64, collection: &str, record: ListedRecord) -> Option<RepoEvent> {
    let uri = match ATURI::from_str(&record.uri) {
        Ok(uri) => uri,
        Err(err) => {
            warn!(did = %did, uri = %record.uri, error = ?err, "Skipping record with malformed path");
            return None;
        }
    };
    if uri.authority != did || uri.collection != collection {
        warn!(did = %did, uri = %record.uri, "Skipping record outside the requested collection");
        return None;
    }

    let rkey_ok = match collection {
        COLLECTION_POST => is_tid(&uri.record_key),
        COLLECTION_PROFILE => uri.record_key == "self",
        _ => true,
    };
    if !rkey_ok {
        debug!(did = %did, uri = %record.uri, "Skipping record with unexpected rkey");
        return None;
    }

    Some(RepoEvent::new(
        seq,
        did,
        EventKind::RecordCreate(RecordOp {
            collection: collection.to_string(),
            rkey: uri.record_key,
            cid: record.cid,
            record: record.value,
        }),
    ))
}

/// Lists posts and the profile of `did` and returns them as creates, in
/// collection order then listing order.
pub async fn replay_repo_snapshot(
    fetcher: &dyn RepoFetcher,
    pds: &str,
    did: &str,
    seq: i64,
) -> Result<Vec<RepoEvent>, ConsumerError> {
    let mut events = Vec::new();

    for collection in [COLLECTION_POST, COLLECTION_PROFILE] {
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES_PER_COLLECTION {
            let page = fetcher
                .list_records(pds, did, collection, cursor.as_deref())
                .await
                .map_err(|err| ConsumerError::SnapshotFailed {
                    did: did.to_string(),
                    details: err.to_string(),
                })?;

            let fetched = page.records.len();
            events.extend(
                page.records
                    .into_iter()
                    .filter_map(|record| snapshot_event(did, seq, collection, record)),
            );

            match page.cursor {
                Some(next) if fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }
    }

    debug!(did = %did, seq, records = events.len(), "Repository snapshot listed");
    Ok(events)
}
