use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    AccountMeta, AccountRelationship, IdentityDirectory, PrivateAccountSource,
    PublicAccountSource, build_cache, log_degraded,
};
use crate::errors::{EngineError, XrpcError};

#[derive(Clone, Debug)]
pub struct AccountCacheConfig {
    pub capacity: u64,
    pub ttl: Duration,
    /// Upper bound for each individual source call.
    pub call_timeout: Duration,
}

impl Default for AccountCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            ttl: Duration::from_secs(30 * 60),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Read-through cache of merged account metadata.
///
/// Only complete entries are cached. When a source fails the partial
/// metadata is returned to the caller but the next resolve fetches again.
pub struct AccountCache {
    directory: Arc<dyn IdentityDirectory>,
    public: Arc<dyn PublicAccountSource>,
    private: Option<Arc<dyn PrivateAccountSource>>,
    entries: Cache<String, Arc<AccountMeta>>,
    call_timeout: Duration,
}

impl AccountCache {
    pub fn new(
        directory: Arc<dyn IdentityDirectory>,
        public: Arc<dyn PublicAccountSource>,
        private: Option<Arc<dyn PrivateAccountSource>>,
        config: AccountCacheConfig,
    ) -> Self {
        Self {
            directory,
            public,
            private,
            entries: build_cache(config.capacity, config.ttl),
            call_timeout: config.call_timeout,
        }
    }

    async fn bounded<T, F>(&self, component: &str, call: F) -> Result<T, XrpcError>
    where
        F: Future<Output = Result<T, XrpcError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(XrpcError::Timeout {
                method: component.to_string(),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn resolve(&self, did: &str) -> Result<Arc<AccountMeta>, EngineError> {
        if let Some(meta) = self.entries.get(did).await {
            return Ok(meta);
        }

        let identity = match tokio::time::timeout(self.call_timeout, self.directory.lookup_did(did))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::unavailable(
                    "identity",
                    format!("lookup timed out after {}ms", self.call_timeout.as_millis()),
                ));
            }
        };

        let mut complete = true;

        let public = match self.bounded("profile", self.public.profile(did)).await {
            Ok(public) => Some(public),
            Err(err @ XrpcError::NotFound { .. }) => {
                log_degraded(did, "profile", &err);
                None
            }
            Err(err) => {
                log_degraded(did, "profile", &err);
                complete = false;
                None
            }
        };

        let private = match &self.private {
            Some(source) => match self.bounded("private", source.private_facts(did)).await {
                Ok(private) => Some(private),
                Err(err) => {
                    log_degraded(did, "private", &err);
                    complete = false;
                    None
                }
            },
            None => None,
        };

        let meta = Arc::new(AccountMeta {
            identity,
            public,
            private,
        });

        if complete {
            self.entries.insert(did.to_string(), meta.clone()).await;
        } else {
            debug!(did = %did, "Returning partial account metadata without caching");
        }

        Ok(meta)
    }

    /// Forces the next [`resolve`](Self::resolve) for `did` to refetch.
    pub async fn invalidate(&self, did: &str) {
        self.entries.invalidate(did).await;
        self.directory.purge(did).await;
    }

    /// Relationship of `other` to `actor`. Not cached.
    pub async fn relationship(
        &self,
        actor: &str,
        other: &str,
    ) -> Result<AccountRelationship, EngineError> {
        self.bounded("relationship", self.public.relationship(actor, other))
            .await
            .map_err(|err| EngineError::from_xrpc("relationship", other, err))
    }
}
