//! DID document lookups with an in-process LRU in front of the resolver.

use async_trait::async_trait;
use atproto_identity::{model::Document, resolve::IdentityResolver};
use chrono::{Duration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::account::{Identity, IdentityDirectory};
use crate::errors::EngineError;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub memory_cache_size: usize,
    pub memory_ttl_seconds: i64,
    /// Failed lookups are remembered this long so a broken DID is not
    /// re-resolved for every event it authors.
    pub error_ttl_seconds: i64,
    pub lookup_timeout: std::time::Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 1000,
            memory_ttl_seconds: 300,
            error_ttl_seconds: 60,
            lookup_timeout: std::time::Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
enum CachedLookup {
    Found(Identity),
    Failed(String),
}

#[derive(Clone)]
struct CachedEntry {
    lookup: CachedLookup,
    cached_at: chrono::DateTime<Utc>,
}

impl CachedEntry {
    fn is_expired(&self, config: &CacheConfig) -> bool {
        let ttl = match self.lookup {
            CachedLookup::Found(_) => config.memory_ttl_seconds,
            CachedLookup::Failed(_) => config.error_ttl_seconds,
        };
        Utc::now() - self.cached_at > Duration::seconds(ttl)
    }
}

pub struct CachingIdentityDirectory<R>
where
    R: IdentityResolver + 'static,
{
    base_resolver: Arc<R>,
    memory_cache: Arc<RwLock<LruCache<String, CachedEntry>>>,
    config: CacheConfig,
}

impl<R> CachingIdentityDirectory<R>
where
    R: IdentityResolver + 'static,
{
    pub fn new(base_resolver: Arc<R>) -> Self {
        Self::with_config(base_resolver, CacheConfig::default())
    }

    pub fn with_config(base_resolver: Arc<R>, config: CacheConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.memory_cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            base_resolver,
            memory_cache: Arc::new(RwLock::new(LruCache::new(cache_size))),
            config,
        }
    }

    async fn cached(&self, did: &str) -> Option<CachedLookup> {
        let mut cache = self.memory_cache.write().await;
        if let Some(entry) = cache.get(did) {
            if !entry.is_expired(&self.config) {
                return Some(entry.lookup.clone());
            }
            cache.pop(did);
        }
        None
    }

    async fn store(&self, did: &str, lookup: CachedLookup) {
        let entry = CachedEntry {
            lookup,
            cached_at: Utc::now(),
        };
        self.memory_cache.write().await.put(did.to_string(), entry);
    }
}

/// Current handle and PDS taken from a DID document.
pub fn identity_from_document(document: &Document) -> Identity {
    let handle = document
        .also_known_as
        .iter()
        .find_map(|aka| aka.strip_prefix("at://").map(|s| s.to_string()));
    let pds_endpoint = document
        .pds_endpoints()
        .first()
        .map(|endpoint| endpoint.to_string());

    Identity {
        did: document.id.to_string(),
        handle,
        pds_endpoint,
    }
}

#[async_trait]
impl<R> IdentityDirectory for CachingIdentityDirectory<R>
where
    R: IdentityResolver + Send + Sync + 'static,
{
    async fn lookup_did(&self, did: &str) -> Result<Identity, EngineError> {
        if !did.starts_with("did:") {
            return Err(EngineError::malformed(format!("not a DID: {}", did)));
        }

        match self.cached(did).await {
            Some(CachedLookup::Found(identity)) => return Ok(identity),
            Some(CachedLookup::Failed(details)) => {
                return Err(EngineError::unavailable("identity", details));
            }
            None => {}
        }

        let resolved =
            tokio::time::timeout(self.config.lookup_timeout, self.base_resolver.resolve(did)).await;

        match resolved {
            Ok(Ok(document)) => {
                let identity = identity_from_document(&document);
                debug!(did = %did, handle = ?identity.handle, "Resolved identity");
                self.store(did, CachedLookup::Found(identity.clone())).await;
                Ok(identity)
            }
            Ok(Err(err)) => {
                warn!(did = %did, error = ?err, "Identity resolution failed");
                self.store(did, CachedLookup::Failed(err.to_string())).await;
                Err(EngineError::unavailable("identity", err))
            }
            Err(_) => Err(EngineError::unavailable(
                "identity",
                format!(
                    "resolution timed out after {}ms",
                    self.config.lookup_timeout.as_millis()
                ),
            )),
        }
    }

    async fn purge(&self, did: &str) {
        self.memory_cache.write().await.pop(did);
    }
}
