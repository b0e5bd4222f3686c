use anyhow::Result;
use atproto_identity::resolve::{
    HickoryDnsResolver, InnerIdentityResolver, SharedIdentityResolver,
};
use deadpool_redis::Pool as RedisPool;
use skywarden::{
    account::{
        AccountCache, AccountCacheConfig, NoopPublicAccountSource, PrivateAccountSource,
        PublicAccountSource,
    },
    cache::create_cache_pool,
    config::Config,
    consumer::{
        FirehoseEventHandler, FirehoseSettings, ShardedDispatcher, run_firehose,
        spawn_shard_workers,
    },
    context::EvalServices,
    counters::{CountStore, MemoryCountStore, RedisCountStore},
    cursor::{
        CursorCheckpointer, CursorStore, CursorTracker, FileCursorStore, MemoryCursorStore,
        RedisCursorStore,
    },
    effects::{
        EffectApplier, LoggingModerationBackend, LoggingNotifier, ModerationBackend,
        NotificationSink, SlackNotifier,
    },
    engine::{Engine, PolicyReloader, PolicySource},
    flags::{FlagStore, MemoryFlagStore, RedisFlagStore},
    identity_cache::{CacheConfig, CachingIdentityDirectory},
    metrics::create_metrics_publisher,
    ozone_poller::OzonePoller,
    rules::RuleRegistry,
    sets::SetStore,
    tasks::{spawn_cancellable_task, spawn_draining_task},
    xrpc::{XrpcClient, appview::AppviewClient, ozone::OzoneClient, pds::PdsRepoClient},
};
use std::{env, sync::Arc};
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let version = skywarden::config::version()?;

    env::args().for_each(|arg| {
        if arg == "--version" {
            println!("{version}");
            std::process::exit(0);
        }
    });

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "skywarden=info,warn".into()),
    );

    let fmt_layer = if std::env::var("JSON_LOGS").is_ok() {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!(version = %version, "Starting skywarden");

    let config = Config::new()?;

    let redis_pool: Option<RedisPool> = if let Some(redis_url) = &config.redis_url {
        match create_cache_pool(redis_url) {
            Ok(pool) => {
                tracing::info!("Redis pool created successfully");
                Some(pool)
            }
            Err(e) => {
                tracing::warn!(error = ?e, "Failed to create Redis pool, using in-process state");
                None
            }
        }
    } else {
        tracing::info!("Redis not configured, counters and flags are process-local");
        None
    };

    let metrics = create_metrics_publisher(&config.metrics)?;

    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(config.user_agent.clone())
        .timeout(*config.http_client_timeout.as_ref())
        .build()?;
    let call_timeout = *config.external_call_timeout.as_ref();

    let base_resolver = Arc::new(SharedIdentityResolver(Arc::new(InnerIdentityResolver {
        dns_resolver: Arc::new(HickoryDnsResolver::create_resolver(&[])),
        http_client: http_client.clone(),
        plc_hostname: config.plc_hostname.clone(),
    })));
    let directory = Arc::new(CachingIdentityDirectory::with_config(
        base_resolver,
        CacheConfig {
            memory_cache_size: *config.identity_cache_size.as_ref(),
            memory_ttl_seconds: config.identity_cache_ttl_minutes.to_seconds(),
            lookup_timeout: call_timeout,
            ..Default::default()
        },
    ));

    let public: Arc<dyn PublicAccountSource> = if config.appview_host.is_empty() {
        Arc::new(NoopPublicAccountSource)
    } else {
        Arc::new(AppviewClient::new(XrpcClient::new(
            http_client.clone(),
            &config.appview_host,
            call_timeout,
        )))
    };

    let ozone: Option<OzoneClient> = match (&config.ozone.host, &config.ozone.admin_token) {
        (Some(host), Some(token)) => {
            let moderator_did = config
                .ozone
                .moderator_did
                .as_ref()
                .map(|did| did.as_str().to_string())
                .unwrap_or_else(|| "did:plc:skywarden".to_string());
            Some(OzoneClient::new(
                XrpcClient::new(http_client.clone(), host, call_timeout)
                    .with_basic_auth("admin", token),
                &moderator_did,
            ))
        }
        _ => None,
    };

    let private: Option<Arc<dyn PrivateAccountSource>> = ozone
        .clone()
        .map(|client| Arc::new(client) as Arc<dyn PrivateAccountSource>);

    let accounts = Arc::new(AccountCache::new(
        directory,
        public,
        private,
        AccountCacheConfig {
            capacity: *config.account_cache_size.as_ref() as u64,
            ttl: config.account_cache_ttl_minutes.to_duration(),
            call_timeout,
        },
    ));

    let (counters, flags): (Arc<dyn CountStore>, Arc<dyn FlagStore>) = match &redis_pool {
        Some(pool) => (
            Arc::new(RedisCountStore::new(pool.clone())),
            Arc::new(RedisFlagStore::new(pool.clone())),
        ),
        None => (
            Arc::new(MemoryCountStore::new()),
            Arc::new(MemoryFlagStore::new()),
        ),
    };

    let sets = Arc::new(SetStore::new());
    if let Some(path) = &config.policy.sets_json_path {
        sets.reload_from(path).await?;
    }

    let policy_source = PolicySource {
        ruleset: config.policy.ruleset.clone(),
        rules_config_path: config.policy.rules_config_path.clone(),
        sets_json_path: config.policy.sets_json_path.clone(),
    };
    let registry = RuleRegistry::with_defaults();
    let rules = registry.build(&policy_source.rules_config().await?)?;
    tracing::info!(rules = rules.len(), "Rule set loaded");

    let backend: Arc<dyn ModerationBackend> = match &ozone {
        Some(client) => Arc::new(client.clone()),
        None => Arc::new(LoggingModerationBackend),
    };
    let notifier: Arc<dyn NotificationSink> = match &config.slack_webhook_url {
        Some(url) => Arc::new(SlackNotifier::new(
            http_client.clone(),
            url.clone(),
            call_timeout,
        )),
        None => Arc::new(LoggingNotifier),
    };

    let applier = Arc::new(EffectApplier::new(
        backend,
        notifier,
        flags.clone(),
        counters.clone(),
        metrics.clone(),
        config.apply.clone(),
    ));

    let services = Arc::new(EvalServices {
        accounts,
        counters,
        sets: sets.clone(),
        flags,
        metrics: metrics.clone(),
    });

    let engine = Arc::new(
        Engine::new(services, rules, applier)
            .with_repo_fetcher(Arc::new(PdsRepoClient::new(http_client.clone(), call_timeout))),
    );

    let cursor_store: Arc<dyn CursorStore> = match (&redis_pool, &config.jetstream.cursor_path) {
        (Some(pool), _) => Arc::new(RedisCursorStore::new(
            pool.clone(),
            config.redis_cursor_key.clone(),
            config.redis_cursor_ttl_seconds,
        )),
        (None, Some(path)) => Arc::new(FileCursorStore::new(path.clone())),
        (None, None) => Arc::new(MemoryCursorStore::default()),
    };
    let initial_cursor = match cursor_store.read().await {
        Ok(cursor) => cursor,
        Err(e) => {
            tracing::warn!(error = ?e, "Could not read cursor, starting from the live stream");
            None
        }
    };
    tracing::info!(cursor = ?initial_cursor, store = %cursor_store.describe(), "Cursor loaded");

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    {
        let signal_tracker = tracker.clone();
        let signal_token = token.clone();

        tracing::info!("Starting signal handler task");
        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                () = signal_token.cancelled() => {
                    tracing::info!("Signal handler task shutting down gracefully");
                },
                _ = terminate => {
                    tracing::info!("Received SIGTERM signal, initiating shutdown");
                },
                _ = ctrl_c => {
                    tracing::info!("Received Ctrl+C signal, initiating shutdown");
                },
            }

            signal_tracker.close();
            signal_token.cancel();
            tracing::info!("Signal handler task completed");
        });
    }

    let cursor_tracker = Arc::new(CursorTracker::new());
    let (dispatcher, receivers) =
        ShardedDispatcher::new(config.jetstream.worker_threads, cursor_tracker.clone())?;
    let dispatcher = Arc::new(dispatcher);

    // Workers get their own tracker so the checkpointer can wait for them
    // before its final write.
    let worker_tracker = TaskTracker::new();
    spawn_shard_workers(
        &worker_tracker,
        token.clone(),
        engine.clone(),
        cursor_tracker.clone(),
        receivers,
    );

    let checkpointer = CursorCheckpointer::new(
        cursor_store.clone(),
        cursor_tracker,
        metrics,
        config.jetstream.cursor_write_interval,
        initial_cursor,
    );
    {
        let workers = worker_tracker.clone();
        spawn_draining_task(&tracker, token.clone(), "cursor-checkpointer", move |cancel| async move {
            checkpointer.run(cancel, workers).await
        });
    }

    {
        let reloader = PolicyReloader::new(
            engine.clone(),
            registry,
            sets,
            policy_source,
            config.policy.reload_interval,
        );
        spawn_cancellable_task(&tracker, token.clone(), "policy-reloader", move |cancel| async move {
            reloader.run(cancel).await
        });
    }

    if let Some(client) = ozone {
        let poller = OzonePoller::new(
            client,
            dispatcher.clone(),
            config.ozone.poll_interval,
            chrono::Utc::now(),
        );
        spawn_cancellable_task(&tracker, token.clone(), "ozone-poller", move |cancel| async move {
            poller.run(cancel).await
        });
    }

    {
        let handler = Arc::new(FirehoseEventHandler::new(
            format!("skywarden-{}", version),
            dispatcher,
            config.jetstream.collections.clone(),
            initial_cursor,
        ));
        let settings = FirehoseSettings {
            user_agent: config.user_agent.clone(),
            hostname: config.jetstream.hostname.clone(),
            collections: config.jetstream.collections.clone(),
        };
        tracing::info!(
            hostname = %settings.hostname,
            collections = ?settings.collections,
            shards = config.jetstream.worker_threads,
            "Starting Jetstream consumer"
        );
        spawn_cancellable_task(&tracker, token.clone(), "jetstream-consumer", move |cancel| async move {
            run_firehose(settings, handler, Some(cursor_store), initial_cursor, cancel).await
        });
    }

    tracing::info!("Waiting for all tasks to complete...");
    token.cancelled().await;
    tracker.close();
    tracker.wait().await;
    worker_tracker.close();
    worker_tracker.wait().await;

    tracing::info!("All tasks completed, application shutting down");
    Ok(())
}
