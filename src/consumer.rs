//! Jetstream consumption and per-subject sharding.
//!
//! Events are routed to a fixed number of shard workers by a hash of the
//! subject DID, so every event for one account is evaluated by the same
//! worker in stream order while unrelated accounts proceed in parallel.
//! Firehose events are registered with the [`CursorTracker`] when dispatched
//! and completed by the worker, which is what the persisted cursor follows.

use async_trait::async_trait;
use atproto_jetstream::{
    Consumer as JetstreamConsumer, ConsumerTaskConfig, EventHandler, JetstreamEvent,
};
use metrohash::MetroHash64;
use std::hash::Hasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::cursor::{CursorStore, CursorTracker};
use crate::engine::Engine;
use crate::errors::ConsumerError;
use crate::event::{EventKind, RepoEvent};
use crate::tasks::manager::spawn_draining_task;

const SHARD_QUEUE_SIZE: usize = 500;

/// One unit of work for a shard worker.
#[derive(Debug)]
pub struct ShardItem {
    pub event: RepoEvent,
    /// Counts toward the firehose cursor
    pub tracked: bool,
}

/// Routes events to shard queues by subject DID.
pub struct ShardedDispatcher {
    senders: Vec<mpsc::Sender<ShardItem>>,
    tracker: Arc<CursorTracker>,
}

impl ShardedDispatcher {
    pub fn new(
        shards: usize,
        tracker: Arc<CursorTracker>,
    ) -> Result<(Self, Vec<mpsc::Receiver<ShardItem>>), ConsumerError> {
        if shards == 0 {
            return Err(ConsumerError::ShardCountZero);
        }

        let (senders, receivers) = (0..shards)
            .map(|_| mpsc::channel(SHARD_QUEUE_SIZE))
            .unzip();
        Ok((Self { senders, tracker }, receivers))
    }

    pub fn shard_count(&self) -> usize {
        self.senders.len()
    }

    pub fn shard_for(&self, did: &str) -> usize {
        let mut hasher = MetroHash64::new();
        hasher.write(did.as_bytes());
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    async fn send(&self, event: RepoEvent, tracked: bool) -> Result<(), ConsumerError> {
        let shard = self.shard_for(&event.did);
        let seq = event.seq;
        if tracked {
            self.tracker.begin(seq);
        }
        if self.senders[shard]
            .send(ShardItem { event, tracked })
            .await
            .is_err()
        {
            if tracked {
                // Never completes, so the cursor stays below it.
                warn!(seq, shard, "Shard queue closed; event left in flight");
            }
            return Err(ConsumerError::ShardClosed { shard });
        }
        Ok(())
    }

    /// Queues a firehose event; blocks while the shard is full.
    pub async fn dispatch(&self, event: RepoEvent) -> Result<(), ConsumerError> {
        self.send(event, true).await
    }

    /// Queues an event that has no place in the firehose cursor, such as a
    /// polled moderation event.
    pub async fn dispatch_untracked(&self, event: RepoEvent) -> Result<(), ConsumerError> {
        self.send(event, false).await
    }
}

/// Starts one worker per shard queue.
///
/// A worker finishes the event it is evaluating when cancelled and then
/// stops; queued events stay in flight so the cursor never passes them.
pub fn spawn_shard_workers(
    task_tracker: &TaskTracker,
    token: CancellationToken,
    engine: Arc<Engine>,
    cursor_tracker: Arc<CursorTracker>,
    receivers: Vec<mpsc::Receiver<ShardItem>>,
) {
    for (shard, mut receiver) in receivers.into_iter().enumerate() {
        let engine = engine.clone();
        let cursor_tracker = cursor_tracker.clone();
        spawn_draining_task(task_tracker, token.clone(), "shard-worker", move |cancel| async move {
            loop {
                let item = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    item = receiver.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                };

                let seq = item.event.seq;
                let outcome = engine.process_event(item.event).await;
                trace!(shard, seq, outcome = ?outcome, "Event evaluated");
                if item.tracked {
                    cursor_tracker.complete(seq);
                }
            }
            debug!(shard, "Shard worker stopped");
            Ok(())
        });
    }
}

/// Jetstream handler feeding the shard dispatcher.
pub struct FirehoseEventHandler {
    id: String,
    dispatcher: Arc<ShardedDispatcher>,
    collections: Vec<String>,
    /// Events at or below this sequence number were applied before restart
    resume_floor: AtomicI64,
    skipped: AtomicU64,
}

impl FirehoseEventHandler {
    pub fn new(
        id: impl Into<String>,
        dispatcher: Arc<ShardedDispatcher>,
        collections: Vec<String>,
        resume_floor: Option<i64>,
    ) -> Self {
        Self {
            id: id.into(),
            dispatcher,
            collections,
            resume_floor: AtomicI64::new(resume_floor.unwrap_or(i64::MIN)),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn set_resume_floor(&self, cursor: i64) {
        self.resume_floor.fetch_max(cursor, Ordering::Relaxed);
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    fn wants(&self, event: &RepoEvent) -> bool {
        if self.collections.is_empty() {
            return true;
        }
        let collection = match &event.kind {
            EventKind::RecordCreate(op) | EventKind::RecordUpdate(op) => &op.collection,
            EventKind::RecordDelete { collection, .. } => collection,
            _ => return true,
        };
        self.collections.iter().any(|wanted| wanted == collection)
    }

    /// Filters and dispatches one converted event.
    pub async fn handle_repo_event(&self, event: RepoEvent) -> Result<(), ConsumerError> {
        if event.seq <= self.resume_floor.load(Ordering::Relaxed) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(seq = event.seq, "Skipping event at or below resume cursor");
            return Ok(());
        }
        if !self.wants(&event) {
            return Ok(());
        }
        self.dispatcher.dispatch(event).await
    }
}

#[async_trait]
impl EventHandler for FirehoseEventHandler {
    async fn handle_event(&self, event: JetstreamEvent) -> anyhow::Result<()> {
        let Some(event) = RepoEvent::from_jetstream(event) else {
            return Ok(());
        };
        self.handle_repo_event(event).await?;
        Ok(())
    }

    fn handler_id(&self) -> String {
        self.id.clone()
    }
}

/// Connection settings for [`run_firehose`].
#[derive(Clone, Debug)]
pub struct FirehoseSettings {
    pub user_agent: String,
    pub hostname: String,
    pub collections: Vec<String>,
}

/// Consumes the firehose until cancelled, reconnecting from the persisted
/// cursor after every disconnect.
pub async fn run_firehose(
    settings: FirehoseSettings,
    handler: Arc<FirehoseEventHandler>,
    cursor_store: Option<Arc<dyn CursorStore>>,
    mut cursor: Option<i64>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let reconnect_window = Duration::from_secs(120);
    let max_reconnects_per_window = 30;
    let mut reconnect_count = 0u32;
    let mut last_disconnect = Instant::now() - reconnect_window;

    while !token.is_cancelled() {
        if let Some(store) = &cursor_store {
            match store.read().await {
                Ok(Some(persisted)) if Some(persisted) != cursor => {
                    info!(cursor = persisted, store = %store.describe(), "Resuming firehose from persisted cursor");
                    handler.set_resume_floor(persisted);
                    cursor = Some(persisted);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = ?err, "Could not read cursor, reusing last known position");
                }
            }
        }
        if cursor.is_none() {
            debug!("No persisted cursor; starting from the live stream");
        }

        let now = Instant::now();
        if now.duration_since(last_disconnect) < reconnect_window {
            reconnect_count += 1;
            if reconnect_count > max_reconnects_per_window {
                warn!(count = reconnect_count, "Too many reconnects, backing off");
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(reconnect_window) => {}
                }
                reconnect_count = 0;
                last_disconnect = now;
                continue;
            }
        } else {
            reconnect_count = 0;
        }

        let consumer = JetstreamConsumer::new(ConsumerTaskConfig {
            user_agent: settings.user_agent.clone(),
            compression: false,
            zstd_dictionary_location: String::new(),
            jetstream_hostname: settings.hostname.clone(),
            collections: settings.collections.clone(),
            dids: vec![],
            max_message_size_bytes: Some(15 * 1024 * 1024),
            cursor,
            require_hello: true,
        });

        if let Err(err) = consumer.register_handler(handler.clone()).await {
            error!(error = ?err, "Failed to register firehose handler");
            tokio::time::sleep(Duration::from_secs(5)).await;
            continue;
        }

        match consumer.run_background(token.clone()).await {
            Ok(()) => info!("Firehose consumer stopped"),
            Err(err) => error!(error = ?err, "Firehose connection failed, will reconnect"),
        }
        if token.is_cancelled() {
            break;
        }
        last_disconnect = Instant::now();
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }

    info!(skipped = handler.skipped(), "Firehose task ending");
    Ok(())
}
