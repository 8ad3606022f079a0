//! Cache middleware.
//!
//! Wraps each resolver call. Reads consult the cache and fall back to the
//! loader or a direct downstream call, writing the result through. Writes run
//! the mutation and, only if it succeeded, invalidate the affected keys.
//! Cache trouble never fails a resolution: it is logged and treated as a miss.

use std::{future::Future, hash::Hash, marker::PhantomData, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, instrument, warn};

use crate::loader::{BatchLoader, LoadResult, ResultSink};

use super::{
    keys::{CacheKey, GlobPattern},
    store::CacheStore,
};

/// Middleware configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// When off, reads go straight downstream and writes skip invalidation.
    pub enabled: bool,
    /// TTL for read-through writes. Zero defers to the store default.
    pub read_ttl_seconds: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_ttl_seconds: 0,
        }
    }
}

impl From<&crate::config::MiddlewareSettings> for MiddlewareConfig {
    fn from(settings: &crate::config::MiddlewareSettings) -> Self {
        Self {
            enabled: settings.enabled,
            read_ttl_seconds: settings.read_ttl_seconds,
        }
    }
}

impl MiddlewareConfig {
    pub fn read_ttl(&self) -> Option<Duration> {
        (self.read_ttl_seconds > 0).then(|| Duration::from_secs(self.read_ttl_seconds))
    }
}

/// A cache entry (or group of entries) made stale by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(CacheKey),
    Pattern(GlobPattern),
}

impl Invalidation {
    pub fn key(key: impl Into<CacheKey>) -> Self {
        Self::Key(key.into())
    }

    pub fn pattern(pattern: impl Into<GlobPattern>) -> Self {
        Self::Pattern(pattern.into())
    }
}

/// What the pipeline asks the middleware to do for one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Read {
        key: CacheKey,
        /// Overrides the configured read TTL.
        ttl: Option<Duration>,
    },
    Write {
        invalidations: Vec<Invalidation>,
    },
}

impl Resolution {
    pub fn read(key: CacheKey) -> Self {
        Self::Read { key, ttl: None }
    }

    pub fn read_with_ttl(key: CacheKey, ttl: Duration) -> Self {
        Self::Read {
            key,
            ttl: Some(ttl),
        }
    }

    pub fn write(invalidations: impl IntoIterator<Item = Invalidation>) -> Self {
        Self::Write {
            invalidations: invalidations.into_iter().collect(),
        }
    }
}

/// Shared middleware handle.
#[derive(Clone)]
pub struct CacheMiddleware {
    store: CacheStore,
    config: MiddlewareConfig,
}

impl CacheMiddleware {
    pub fn new(store: CacheStore, config: MiddlewareConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Single entry point for the request pipeline.
    pub async fn resolve<T, E, F, Fut>(&self, resolution: Resolution, downstream: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match resolution {
            Resolution::Read { key, ttl } => self.read(&key, ttl, downstream).await,
            Resolution::Write { invalidations } => self.write(&invalidations, downstream()).await,
        }
    }

    /// Read-through: serve `key` from the cache or compute it with
    /// `downstream` and store the result.
    ///
    /// Downstream errors are returned as-is and nothing is cached.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn read<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        downstream: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return downstream().await;
        }
        if let Some(hit) = self.lookup(key).await {
            return Ok(hit);
        }

        let value = downstream().await?;
        self.fill(key, &value, ttl).await;
        Ok(value)
    }

    /// Read-through backed by a request's batch loader.
    ///
    /// A not-found result is returned but not cached.
    #[instrument(skip_all, fields(key = %key, loader = loader.name()))]
    pub async fn read_batched<K, V>(
        &self,
        key: &CacheKey,
        loader: &BatchLoader<K, V>,
        batch_key: K,
        ttl: Option<Duration>,
    ) -> LoadResult<V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if !self.config.enabled {
            return loader.load(batch_key).await;
        }
        if let Some(hit) = self.lookup(key).await {
            return Ok(Some(hit));
        }

        let loaded = loader.load(batch_key).await?;
        match &loaded {
            Some(value) => self.fill(key, value, ttl).await,
            None => debug!(outcome = "not_found", "Not caching missing record"),
        }
        Ok(loaded)
    }

    /// Run `mutation`; if it succeeds, apply `invalidations`.
    ///
    /// The mutation's result is returned unchanged. Failed invalidations are
    /// logged and otherwise ignored; the TTL bounds any staleness they leave.
    pub async fn write<T, E, Fut>(&self, invalidations: &[Invalidation], mutation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let result = mutation.await;
        if result.is_ok() && self.config.enabled {
            self.invalidate(invalidations).await;
        }
        result
    }

    /// Apply invalidations in order and return how many failed.
    pub async fn invalidate(&self, invalidations: &[Invalidation]) -> usize {
        let mut failed = 0;
        for invalidation in invalidations {
            let outcome = match invalidation {
                Invalidation::Key(key) => self.store.remove(key).await.map(|()| 1),
                Invalidation::Pattern(pattern) => self.store.flush(pattern).await,
            };
            match outcome {
                Ok(removed) => {
                    debug!(invalidation = ?invalidation, removed, "Invalidated cache entries");
                }
                Err(err) => {
                    failed += 1;
                    warn!(
                        invalidation = ?invalidation,
                        error = %err,
                        "Cache invalidation failed after successful mutation"
                    );
                }
            }
        }
        failed
    }

    /// A loader result sink that writes records into this cache under the
    /// key returned by `key_of`.
    pub fn result_sink<K, V, F>(&self, ttl: Option<Duration>, key_of: F) -> Arc<dyn ResultSink<K, V>>
    where
        K: Send + Sync + 'static,
        V: Serialize + Send + Sync + 'static,
        F: Fn(&K) -> CacheKey + Send + Sync + 'static,
    {
        Arc::new(CacheSink {
            store: self.store.clone(),
            ttl: ttl.or(self.config.read_ttl()),
            key_of,
            _records: PhantomData,
        })
    }

    async fn lookup<T>(&self, key: &CacheKey) -> Option<T>
    where
        T: DeserializeOwned,
    {
        match self.store.get(key).await {
            Ok(Some(value)) => {
                debug!(cache = self.store.backend_name(), outcome = "hit", "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(cache = self.store.backend_name(), outcome = "miss", "Cache miss");
                None
            }
            Err(err) => {
                let outcome = if err.is_unavailable() {
                    "unavailable"
                } else {
                    "undecodable"
                };
                warn!(
                    cache = self.store.backend_name(),
                    outcome,
                    error = %err,
                    "Cache read failed, falling back to downstream"
                );
                None
            }
        }
    }

    async fn fill<T>(&self, key: &CacheKey, value: &T, ttl: Option<Duration>)
    where
        T: Serialize,
    {
        let ttl = ttl.or(self.config.read_ttl());
        if let Err(err) = self.store.set(key, value, ttl).await {
            warn!(
                cache = self.store.backend_name(),
                error = %err,
                "Cache write-through failed"
            );
        }
    }
}

struct CacheSink<K, V, F> {
    store: CacheStore,
    ttl: Option<Duration>,
    key_of: F,
    _records: PhantomData<fn(K, V)>,
}

#[async_trait]
impl<K, V, F> ResultSink<K, V> for CacheSink<K, V, F>
where
    K: Send + Sync + 'static,
    V: Serialize + Send + Sync + 'static,
    F: Fn(&K) -> CacheKey + Send + Sync + 'static,
{
    async fn accept(&self, records: Vec<(K, V)>) {
        for (key, value) in &records {
            let key = (self.key_of)(key);
            if let Err(err) = self.store.set(&key, value, self.ttl).await {
                warn!(key = %key, error = %err, "Failed to cache record from aborted request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_ttl_zero_defers_to_store() {
        assert_eq!(MiddlewareConfig::default().read_ttl(), None);
        let config = MiddlewareConfig {
            read_ttl_seconds: 30,
            ..Default::default()
        };
        assert_eq!(config.read_ttl(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn resolution_constructors() {
        let key = CacheKey::entity("user", 1);
        assert_eq!(
            Resolution::read(key.clone()),
            Resolution::Read {
                key: key.clone(),
                ttl: None
            }
        );
        assert_eq!(
            Resolution::write([Invalidation::key("user:1"), Invalidation::pattern("users.list:*")]),
            Resolution::Write {
                invalidations: vec![
                    Invalidation::Key(key),
                    Invalidation::Pattern(GlobPattern::new("users.list:*")),
                ],
            }
        );
    }
}
