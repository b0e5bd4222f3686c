//! Feeds moderator actions taken in Ozone back into the engine.
//!
//! Ozone has no push stream, so `queryEvents` is polled on an interval and
//! each new event is dispatched to the subject's shard. These events are not
//! part of the firehose and never move the firehose cursor.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consumer::ShardedDispatcher;
use crate::event::{EventKind, RepoEvent};
use crate::xrpc::ozone::OzoneClient;

const PAGE_SIZE: u32 = 100;
const MAX_PAGES_PER_POLL: usize = 20;

struct PollPosition {
    created_after: DateTime<Utc>,
    last_id: Option<i64>,
}

pub struct OzonePoller {
    client: OzoneClient,
    dispatcher: Arc<ShardedDispatcher>,
    interval: Duration,
    position: Mutex<PollPosition>,
}

impl OzonePoller {
    /// Starts polling from `start`; events created earlier are never seen.
    pub fn new(
        client: OzoneClient,
        dispatcher: Arc<ShardedDispatcher>,
        interval: Duration,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            interval,
            position: Mutex::new(PollPosition {
                created_after: start,
                last_id: None,
            }),
        }
    }

    /// Reads every event newer than the last one seen and dispatches it.
    /// Returns the number dispatched.
    ///
    /// The position advances with each dispatched event, so a failed page
    /// never causes earlier events of the same poll to be dispatched again.
    pub async fn poll_once(&self) -> anyhow::Result<usize> {
        let (created_after, mut last_id) = {
            let position = self.position.lock();
            (position.created_after, position.last_id)
        };
        let mut cursor: Option<String> = None;
        let mut dispatched = 0;

        for _ in 0..MAX_PAGES_PER_POLL {
            let page = self
                .client
                .query_events(created_after, cursor.as_deref(), PAGE_SIZE)
                .await?;
            let fetched = page.events.len();

            for event in page.events {
                // createdAfter is inclusive on some deployments
                if last_id.is_some_and(|last| event.id <= last) {
                    continue;
                }
                let (id, created_at) = (event.id, event.created_at);

                let repo_event = RepoEvent::new(
                    id,
                    event.subject_did.clone(),
                    EventKind::OzoneModerationEvent(event),
                );
                self.dispatcher.dispatch_untracked(repo_event).await?;
                self.advance(id, created_at);
                last_id = Some(last_id.map_or(id, |last| last.max(id)));
                dispatched += 1;
            }

            match page.cursor {
                Some(next) if fetched > 0 && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        Ok(dispatched)
    }

    fn advance(&self, id: i64, created_at: DateTime<Utc>) {
        let mut position = self.position.lock();
        position.last_id = Some(position.last_id.map_or(id, |last| last.max(id)));
        position.created_after = position.created_after.max(created_at);
    }

    pub async fn run(&self, token: CancellationToken) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Ozone event poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "Dispatched moderation events"),
                        Err(err) => warn!(error = ?err, "Moderation event poll failed"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorTracker;
    use crate::xrpc::XrpcClient;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mod_event(id: i64, created_at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "event": {
                "$type": "tools.ozone.moderation.defs#modEventTag",
                "add": ["harassment-protection"],
                "remove": []
            },
            "subject": {"$type": "com.atproto.admin.defs#repoRef", "did": "did:plc:target"},
            "subjectBlobCids": [],
            "createdBy": "did:plc:moderator",
            "createdAt": created_at
        })
    }

    #[tokio::test]
    async fn test_poll_dispatches_new_events_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.queryEvents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [
                    mod_event(7, "2024-06-01T00:00:01.000Z"),
                    mod_event(8, "2024-06-01T00:00:02.000Z")
                ]
            })))
            .mount(&server)
            .await;

        let client = OzoneClient::new(
            XrpcClient::new(reqwest::Client::new(), &server.uri(), Duration::from_secs(1)),
            "did:plc:moderator",
        );
        let tracker = Arc::new(CursorTracker::new());
        let (dispatcher, mut receivers) = ShardedDispatcher::new(1, tracker.clone()).unwrap();
        let poller = OzonePoller::new(
            client,
            Arc::new(dispatcher),
            Duration::from_secs(10),
            "2024-06-01T00:00:00Z".parse().unwrap(),
        );

        assert_eq!(poller.poll_once().await.unwrap(), 2);
        // The mock replays the same page; already-seen ids are skipped.
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        let first = receivers[0].recv().await.unwrap();
        assert!(!first.tracked);
        assert_eq!(first.event.seq, 7);
        assert_eq!(first.event.did, "did:plc:target");
        assert!(matches!(
            &first.event.kind,
            EventKind::OzoneModerationEvent(ev) if ev.event_type == "tag" && ev.add_tags == vec!["harassment-protection".to_string()]
        ));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_page_keeps_earlier_dispatches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.queryEvents"))
            .and(query_param("cursor", "page-2"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.queryEvents"))
            .and(query_param("cursor", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"events": []})))
            .with_priority(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/xrpc/tools.ozone.moderation.queryEvents"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "events": [
                    mod_event(7, "2024-06-01T00:00:01.000Z"),
                    mod_event(8, "2024-06-01T00:00:02.000Z")
                ],
                "cursor": "page-2"
            })))
            .with_priority(3)
            .mount(&server)
            .await;

        let client = OzoneClient::new(
            XrpcClient::new(reqwest::Client::new(), &server.uri(), Duration::from_secs(1)),
            "did:plc:moderator",
        );
        let tracker = Arc::new(CursorTracker::new());
        let (dispatcher, mut receivers) = ShardedDispatcher::new(1, tracker).unwrap();
        let poller = OzonePoller::new(
            client,
            Arc::new(dispatcher),
            Duration::from_secs(10),
            "2024-06-01T00:00:00Z".parse().unwrap(),
        );

        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.poll_once().await.unwrap(), 0);

        let mut seqs = Vec::new();
        while let Ok(item) = receivers[0].try_recv() {
            seqs.push(item.event.seq);
        }
        assert_eq!(seqs, vec![7, 8]);
    }
}
