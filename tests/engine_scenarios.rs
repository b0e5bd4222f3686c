//! End-to-end evaluation scenarios through the public engine API.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use skywarden::account::{
    AccountCache, AccountCacheConfig, AccountPrivate, AccountPublic, AccountRelationship,
    Identity, IdentityDirectory, PrivateAccountSource, PublicAccountSource,
};
use skywarden::config::ApplyConfig;
use skywarden::consumer::{FirehoseEventHandler, ShardedDispatcher, spawn_shard_workers};
use skywarden::context::{EvalServices, RecordContext};
use skywarden::counters::{CountStore, MemoryCountStore, Period};
use skywarden::cursor::{CursorCheckpointer, CursorStore, CursorTracker, MemoryCursorStore};
use skywarden::effects::{EffectApplier, ModerationBackend, NotificationSink, ReportReason};
use skywarden::engine::Engine;
use skywarden::errors::{EngineError, XrpcError};
use skywarden::event::{EventKind, RecordOp, RepoEvent};
use skywarden::flags::{FlagStore, MemoryFlagStore};
use skywarden::metrics::NoOpMetricsPublisher;
use skywarden::repo_fetch::{ListRecordsPage, ListedRecord, RepoFetcher};
use skywarden::rules::records::Post;
use skywarden::rules::{PostRule, Rule, RuleRegistry, RulesConfig};
use skywarden::sets::SetStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const AUTHOR: &str = "did:plc:author";
const TARGET: &str = "did:plc:target";
const PDS: &str = "https://pds.example";

#[derive(Default)]
struct World {
    follows: Mutex<HashSet<(String, String)>>,
    private: Mutex<HashMap<String, AccountPrivate>>,
}

impl World {
    fn add_follow(&self, follower: &str, followed: &str) {
        self.follows
            .lock()
            .insert((follower.to_string(), followed.to_string()));
    }

    fn set_new_account(&self, did: &str) {
        self.private.lock().insert(
            did.to_string(),
            AccountPrivate {
                indexed_at: Some(Utc::now() - ChronoDuration::hours(2)),
                ..Default::default()
            },
        );
    }

    fn follows(&self, follower: &str, followed: &str) -> bool {
        self.follows
            .lock()
            .contains(&(follower.to_string(), followed.to_string()))
    }
}

#[async_trait]
impl IdentityDirectory for World {
    async fn lookup_did(&self, did: &str) -> Result<Identity, EngineError> {
        Ok(Identity {
            did: did.to_string(),
            handle: Some("someone.test".to_string()),
            pds_endpoint: Some(PDS.to_string()),
        })
    }

    async fn purge(&self, _did: &str) {}
}

#[async_trait]
impl PublicAccountSource for World {
    async fn profile(&self, _did: &str) -> Result<AccountPublic, XrpcError> {
        Ok(AccountPublic::default())
    }

    async fn relationship(
        &self,
        actor: &str,
        other: &str,
    ) -> Result<AccountRelationship, XrpcError> {
        Ok(AccountRelationship {
            did: other.to_string(),
            following: self.follows(actor, other),
            followed_by: self.follows(other, actor),
        })
    }
}

#[async_trait]
impl PrivateAccountSource for World {
    async fn private_facts(&self, did: &str) -> Result<AccountPrivate, XrpcError> {
        Ok(self.private.lock().get(did).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct Backend {
    calls: Mutex<Vec<String>>,
}

impl Backend {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ModerationBackend for Backend {
    async fn add_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.calls.lock().push(format!("label:{}:{}", did, label));
        Ok(())
    }

    async fn remove_account_label(&self, did: &str, label: &str) -> Result<(), XrpcError> {
        self.calls.lock().push(format!("unlabel:{}:{}", did, label));
        Ok(())
    }

    async fn add_account_tag(&self, did: &str, tag: &str) -> Result<(), XrpcError> {
        self.calls.lock().push(format!("tag:{}:{}", did, tag));
        Ok(())
    }

    async fn report_account(
        &self,
        did: &str,
        reason: ReportReason,
        _comment: &str,
    ) -> Result<(), XrpcError> {
        self.calls
            .lock()
            .push(format!("report:{}:{}", did, reason.as_str()));
        Ok(())
    }
}

#[derive(Default)]
struct Notifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for Notifier {
    async fn notify(&self, channel: &str, _message: &str) -> anyhow::Result<()> {
        self.sent.lock().push(channel.to_string());
        Ok(())
    }
}

struct Harness {
    engine: Arc<Engine>,
    world: Arc<World>,
    backend: Arc<Backend>,
    notifier: Arc<Notifier>,
    counters: Arc<MemoryCountStore>,
    flags: Arc<MemoryFlagStore>,
}

struct HarnessBuilder {
    with_private: bool,
    sets: HashMap<String, Vec<String>>,
    registry: RuleRegistry,
    rules: RulesConfig,
    fetcher: Option<Arc<dyn RepoFetcher>>,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            with_private: true,
            sets: HashMap::new(),
            registry: RuleRegistry::with_defaults(),
            rules: RulesConfig::named("default").unwrap(),
            fetcher: None,
        }
    }

    fn without_private(mut self) -> Self {
        self.with_private = false;
        self
    }

    fn set(mut self, name: &str, members: &[&str]) -> Self {
        self.sets.insert(
            name.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    fn build(self) -> Harness {
        let world = Arc::new(World::default());
        let backend = Arc::new(Backend::default());
        let notifier = Arc::new(Notifier::default());
        let counters = Arc::new(MemoryCountStore::new());
        let flags = Arc::new(MemoryFlagStore::new());
        let metrics = Arc::new(NoOpMetricsPublisher::new());

        let private: Option<Arc<dyn PrivateAccountSource>> = if self.with_private {
            Some(world.clone())
        } else {
            None
        };
        let accounts = AccountCache::new(
            world.clone(),
            world.clone(),
            private,
            AccountCacheConfig::default(),
        );
        let services = Arc::new(EvalServices {
            accounts: Arc::new(accounts),
            counters: counters.clone(),
            sets: Arc::new(SetStore::from_sets(self.sets)),
            flags: flags.clone(),
            metrics: metrics.clone(),
        });
        let applier = Arc::new(EffectApplier::new(
            backend.clone(),
            notifier.clone(),
            flags.clone(),
            counters.clone(),
            metrics,
            ApplyConfig {
                max_retries: 0,
                retry_delay_ms: 1,
                max_retry_delay_ms: 1,
            },
        ));

        let rules = self.registry.build(&self.rules).unwrap();
        let mut engine = Engine::new(services, rules, applier);
        if let Some(fetcher) = self.fetcher {
            engine = engine.with_repo_fetcher(fetcher);
        }

        Harness {
            engine: Arc::new(engine),
            world,
            backend,
            notifier,
            counters,
            flags,
        }
    }
}

fn post_event(seq: i64, rkey: &str, record: Value) -> RepoEvent {
    RepoEvent::new(
        seq,
        AUTHOR,
        EventKind::RecordCreate(RecordOp {
            collection: "app.bsky.feed.post".to_string(),
            rkey: rkey.to_string(),
            cid: Some("bafyreib".to_string()),
            record,
        }),
    )
}

fn text_post(text: &str) -> Value {
    json!({
        "$type": "app.bsky.feed.post",
        "text": text,
        "createdAt": "2024-06-01T00:00:00.000Z"
    })
}

fn mention_post(dids: &[&str]) -> Value {
    let facets: Vec<Value> = dids
        .iter()
        .map(|did| {
            json!({
                "index": {"byteStart": 0, "byteEnd": 4},
                "features": [{"$type": "app.bsky.richtext.facet#mention", "did": did}]
            })
        })
        .collect();
    json!({
        "$type": "app.bsky.feed.post",
        "text": "@you hello",
        "facets": facets,
        "createdAt": "2024-06-01T00:00:00.000Z"
    })
}

fn tagged_post(tags: &[String]) -> Value {
    let text = tags
        .iter()
        .map(|t| format!("#{}", t))
        .collect::<Vec<_>>()
        .join(" ");
    json!({
        "$type": "app.bsky.feed.post",
        "text": text,
        "tags": tags,
        "createdAt": "2024-06-01T00:00:00.000Z"
    })
}

fn reports(calls: &[String]) -> usize {
    calls.iter().filter(|c| c.starts_with("report:")).count()
}

#[tokio::test]
async fn test_unknown_private_facts_never_escalate() {
    let h = HarnessBuilder::new()
        .without_private()
        .set("harassment-target-dids", &[TARGET])
        .build();

    for seq in 1..=7 {
        let outcome = h
            .engine
            .process_event(post_event(seq, &format!("3l3qo2vuowo2{}", seq), text_post("F")))
            .await;
        assert_eq!(outcome.rule_failures, 0);
    }
    h.engine
        .process_event(post_event(8, "3l3qo2vuowo3a", mention_post(&[TARGET])))
        .await;

    assert!(h.backend.calls().is_empty());
    assert!(h.notifier.sent.lock().is_empty());
}

#[tokio::test]
async fn test_sixth_trivial_post_escalates_once() {
    let h = HarnessBuilder::new().build();
    h.world.set_new_account(AUTHOR);

    for seq in 1..=5 {
        h.engine
            .process_event(post_event(seq, &format!("3l3qo2vuowo2{}", seq), text_post("F")))
            .await;
    }
    assert!(h.backend.calls().is_empty());

    let outcome = h
        .engine
        .process_event(post_event(6, "3l3qo2vuowo26", text_post("F")))
        .await;
    assert_eq!(outcome.flush.applied, 2);
    assert_eq!(
        h.backend.calls(),
        vec![
            format!("report:{}:other", AUTHOR),
            format!("label:{}:!hide", AUTHOR),
        ]
    );
    assert_eq!(h.notifier.sent.lock().as_slice(), ["slack".to_string()]);

    // At most one report per account per day.
    h.engine
        .process_event(post_event(7, "3l3qo2vuowo27", text_post("F")))
        .await;
    assert_eq!(reports(&h.backend.calls()), 1);
}

#[tokio::test]
async fn test_redelivered_event_counts_once() {
    let h = HarnessBuilder::new().build();
    h.world.set_new_account(AUTHOR);

    let event = post_event(41, "3l3qo2vuowo2b", text_post("F"));
    h.engine.process_event(event.clone()).await;
    h.engine.process_event(event).await;

    assert_eq!(
        h.counters
            .get_count("trivial-harassing", AUTHOR, Period::Day, Utc::now())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_repeated_mentions_report_once() {
    let h = HarnessBuilder::new()
        .set("harassment-target-dids", &[TARGET])
        .build();
    h.world.set_new_account(AUTHOR);

    let outcome = h
        .engine
        .process_event(post_event(10, "3l3qo2vuowo2b", mention_post(&[TARGET, TARGET])))
        .await;

    assert_eq!(outcome.rule_failures, 0);
    let calls = h.backend.calls();
    assert_eq!(reports(&calls), 1);
    assert!(calls.contains(&format!("label:{}:!hide", AUTHOR)));
}

#[tokio::test]
async fn test_target_following_author_is_exempt() {
    let h = HarnessBuilder::new()
        .set("harassment-target-dids", &[TARGET])
        .build();
    h.world.set_new_account(AUTHOR);
    h.world.add_follow(TARGET, AUTHOR);

    h.engine
        .process_event(post_event(10, "3l3qo2vuowo2b", mention_post(&[TARGET])))
        .await;

    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn test_hashtag_density_flags_record() {
    let h = HarnessBuilder::new().build();
    let eight: Vec<String> = (0..8).map(|i| format!("hashtag{}", i)).collect();

    h.engine
        .process_event(post_event(1, "3l3qo2vuowo2b", tagged_post(&eight)))
        .await;
    h.engine
        .process_event(post_event(2, "3l3qo2vuowo2c", tagged_post(&eight[..3])))
        .await;

    let dense = format!("at://{}/app.bsky.feed.post/3l3qo2vuowo2b", AUTHOR);
    let sparse = format!("at://{}/app.bsky.feed.post/3l3qo2vuowo2c", AUTHOR);
    assert!(h.flags.get_flags(&dense).await.unwrap().contains("many-hashtags"));
    assert!(h.flags.get_flags(&sparse).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_set_is_not_membership() {
    let h = HarnessBuilder::new().build();

    h.engine
        .process_event(post_event(
            1,
            "3l3qo2vuowo2b",
            tagged_post(&["slur".to_string()]),
        ))
        .await;

    let uri = format!("at://{}/app.bsky.feed.post/3l3qo2vuowo2b", AUTHOR);
    assert!(h.flags.get_flags(&uri).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_record_skips_post_rules() {
    let h = HarnessBuilder::new().build();
    h.world.set_new_account(AUTHOR);

    let outcome = h
        .engine
        .process_event(post_event(1, "3l3qo2vuowo2b", json!({"text": 42})))
        .await;

    assert!(outcome.malformed);
    assert_eq!(outcome.rule_failures, 0);
    assert!(h.backend.calls().is_empty());
}

struct PanickingRule;

#[async_trait]
impl PostRule for PanickingRule {
    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn check(&self, _ctx: &mut RecordContext, _post: &Post) -> anyhow::Result<()> {
        panic!("rule bug");
    }
}

struct FailingRule;

#[async_trait]
impl PostRule for FailingRule {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn check(&self, _ctx: &mut RecordContext, _post: &Post) -> anyhow::Result<()> {
        anyhow::bail!("backend unreachable")
    }
}

#[tokio::test]
async fn test_failing_rules_do_not_stop_others() {
    let mut builder = HarnessBuilder::new();
    builder.registry.register(Rule::Post(Arc::new(PanickingRule)));
    builder.registry.register(Rule::Post(Arc::new(FailingRule)));
    builder.rules = RulesConfig {
        post: vec![
            "panicking".to_string(),
            "failing".to_string(),
            "too-many-hashtags".to_string(),
        ],
        ..Default::default()
    };
    let h = builder.build();
    let eight: Vec<String> = (0..8).map(|i| format!("hashtag{}", i)).collect();

    let outcome = h
        .engine
        .process_event(post_event(1, "3l3qo2vuowo2b", tagged_post(&eight)))
        .await;

    assert_eq!(outcome.rule_failures, 2);
    let uri = format!("at://{}/app.bsky.feed.post/3l3qo2vuowo2b", AUTHOR);
    assert!(h.flags.get_flags(&uri).await.unwrap().contains("many-hashtags"));
}

struct SnapshotFetcher;

#[async_trait]
impl RepoFetcher for SnapshotFetcher {
    async fn list_records(
        &self,
        pds: &str,
        did: &str,
        collection: &str,
        _cursor: Option<&str>,
    ) -> Result<ListRecordsPage, XrpcError> {
        assert_eq!(pds, PDS);
        let records = if collection == "app.bsky.feed.post" {
            (0..2)
                .map(|i| ListedRecord {
                    uri: format!("at://{}/app.bsky.feed.post/3l3qo2vuowo2{}", did, i),
                    cid: None,
                    value: text_post("F"),
                })
                .collect()
        } else {
            vec![]
        };
        Ok(ListRecordsPage {
            records,
            cursor: None,
        })
    }
}

#[tokio::test]
async fn test_too_big_commit_replays_snapshot() {
    let mut builder = HarnessBuilder::new();
    builder.fetcher = Some(Arc::new(SnapshotFetcher));
    let h = builder.build();
    h.world.set_new_account(AUTHOR);

    let mut event = post_event(500, "3l3qo2vuowo2b", Value::Null);
    event.too_big = true;
    event.since = Some("3l3qo2vuowo2a".to_string());

    let outcome = h.engine.process_event(event.clone()).await;
    assert!(!outcome.dropped);
    assert_eq!(outcome.passes, 2);
    assert_eq!(
        h.counters
            .get_count("trivial-harassing", AUTHOR, Period::Day, Utc::now())
            .await
            .unwrap(),
        1,
        "replayed records share one sequence number"
    );

    event.since = None;
    let outcome = h.engine.process_event(event).await;
    assert!(outcome.dropped);
}

#[tokio::test]
async fn test_resume_skips_applied_events_and_advances_cursor() {
    let h = HarnessBuilder::new().build();
    h.world.set_new_account(AUTHOR);

    let task_tracker = TaskTracker::new();
    let token = CancellationToken::new();
    let cursor_tracker = Arc::new(CursorTracker::new());
    let (dispatcher, receivers) = ShardedDispatcher::new(2, cursor_tracker.clone()).unwrap();
    spawn_shard_workers(
        &task_tracker,
        token.clone(),
        h.engine.clone(),
        cursor_tracker.clone(),
        receivers,
    );

    let store = Arc::new(MemoryCursorStore::new(Some(100)));
    let resume = store.read().await.unwrap();
    let handler = FirehoseEventHandler::new("test", Arc::new(dispatcher), vec![], resume);
    let checkpointer = CursorCheckpointer::new(
        store.clone(),
        cursor_tracker.clone(),
        Arc::new(NoOpMetricsPublisher::new()),
        Duration::from_secs(60),
        resume,
    );

    for seq in [99, 100, 101, 102] {
        handler
            .handle_repo_event(post_event(seq, &format!("3l3qo2vuowo{}", seq), text_post("F")))
            .await
            .unwrap();
    }
    assert_eq!(handler.skipped(), 2);

    for _ in 0..100 {
        if cursor_tracker.in_flight() == 0 && cursor_tracker.safe_cursor() == Some(102) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(checkpointer.checkpoint().await.unwrap(), Some(102));
    assert_eq!(store.read().await.unwrap(), Some(102));
    assert_eq!(
        h.counters
            .get_count("trivial-harassing", AUTHOR, Period::Day, Utc::now())
            .await
            .unwrap(),
        2
    );

    token.cancel();
    task_tracker.close();
    task_tracker.wait().await;
}

struct SlowRule {
    started: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl PostRule for SlowRule {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn check(&self, _ctx: &mut RecordContext, _post: &Post) -> anyhow::Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_final_checkpoint_waits_for_in_flight_event() {
    let started = Arc::new(tokio::sync::Notify::new());
    let mut builder = HarnessBuilder::new();
    builder.registry.register(Rule::Post(Arc::new(SlowRule {
        started: started.clone(),
    })));
    builder.rules = RulesConfig {
        post: vec!["slow".to_string()],
        ..Default::default()
    };
    let h = builder.build();

    let worker_tracker = TaskTracker::new();
    let token = CancellationToken::new();
    let cursor_tracker = Arc::new(CursorTracker::new());
    let (dispatcher, receivers) = ShardedDispatcher::new(1, cursor_tracker.clone()).unwrap();
    spawn_shard_workers(
        &worker_tracker,
        token.clone(),
        h.engine.clone(),
        cursor_tracker.clone(),
        receivers,
    );

    let store = Arc::new(MemoryCursorStore::default());
    let checkpointer = CursorCheckpointer::new(
        store.clone(),
        cursor_tracker.clone(),
        Arc::new(NoOpMetricsPublisher::new()),
        Duration::from_secs(3600),
        None,
    );
    let handler = FirehoseEventHandler::new("test", Arc::new(dispatcher), vec![], None);
    handler
        .handle_repo_event(post_event(500, "3l3qo2vuowo2b", text_post("hello")))
        .await
        .unwrap();

    // Cancel while the event is still being evaluated.
    started.notified().await;
    assert_eq!(cursor_tracker.in_flight(), 1);
    token.cancel();

    checkpointer.run(token, worker_tracker).await.unwrap();

    assert_eq!(cursor_tracker.in_flight(), 0);
    assert_eq!(store.read().await.unwrap(), Some(500));
}
