//! Cache store.
//!
//! `CacheStore` is the shared, process-wide handle the middleware and CLI talk
//! to. It owns namespacing, JSON encoding, default TTLs, per-operation
//! timeouts, and the paginated flush; backends only move strings.

use std::{future::Future, num::NonZeroUsize, sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::config::{CacheBackendKind, CacheConfig};
use super::error::CacheError;
use super::keys::GlobPattern;
use super::memory::MemoryBackend;
use super::redis::RedisBackend;

const METRIC_CACHE_HIT: &str = "gateway_cache_hit_total";
const METRIC_CACHE_MISS: &str = "gateway_cache_miss_total";
const METRIC_CACHE_UNAVAILABLE: &str = "gateway_cache_unavailable_total";
const METRIC_CACHE_WRITE: &str = "gateway_cache_write_total";
const METRIC_CACHE_FLUSH_REMOVED: &str = "gateway_cache_flush_removed_total";

/// One page of a cursor-based key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Full (namespaced) keys in this page.
    pub keys: Vec<String>,
    /// Cursor for the next page, `None` once the scan is complete.
    pub next: Option<String>,
}

/// Storage primitive behind [`CacheStore`].
///
/// Keys passed in are already namespaced. Single-key operations must be
/// atomic with respect to each other.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Returns whether an entry was actually removed.
    async fn remove(&self, key: &str) -> Result<bool, CacheError>;

    /// Return up to roughly `count` keys that start with `prefix` and whose
    /// remainder matches `pattern`. Pages may repeat keys.
    async fn scan(
        &self,
        cursor: Option<&str>,
        prefix: &str,
        pattern: &GlobPattern,
        count: usize,
    ) -> Result<ScanPage, CacheError>;

    /// Remove the given keys in one call and return how many existed.
    async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Shared cache handle.
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    namespace: Arc<str>,
    default_ttl: Option<Duration>,
    scan_count: NonZeroUsize,
    operation_timeout: Duration,
}

impl CacheStore {
    /// Wrap an existing backend with the behavior described by `config`.
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            namespace: Arc::from(config.namespace.as_str()),
            default_ttl: config.default_ttl(),
            scan_count: config.scan_count_non_zero(),
            operation_timeout: config.operation_timeout(),
        }
    }

    /// In-process store sized by `config.capacity`.
    pub fn in_memory(config: &CacheConfig) -> Self {
        let backend = Arc::new(MemoryBackend::new(config.capacity_non_zero()));
        Self::new(backend, config)
    }

    /// Open the backend selected by `config.backend`.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        match config.backend {
            CacheBackendKind::Memory => Ok(Self::in_memory(config)),
            CacheBackendKind::Redis => {
                let url = config.redis_url();
                let connect = RedisBackend::connect(&url, config.pool_size_non_zero());
                let backend = bounded(config.operation_timeout(), "connect", connect).await?;
                Ok(Self::new(Arc::new(backend), config))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Store `value` under `key`.
    ///
    /// `ttl` overrides the configured default; a zero duration (explicit or
    /// default) stores the entry without expiry.
    pub async fn set<T>(
        &self,
        key: &(impl AsRef<str> + ?Sized),
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>
    where
        T: Serialize + ?Sized,
    {
        let key = key.as_ref();
        let encoded =
            serde_json::to_string(value).map_err(|err| CacheError::serialization(key, err))?;
        let ttl = ttl.or(self.default_ttl).filter(|ttl| !ttl.is_zero());
        let wire_key = self.wire_key(key);

        self.observe("set", self.backend.set(&wire_key, encoded, ttl))
            .await?;
        counter!(METRIC_CACHE_WRITE, "backend" => self.backend.name()).increment(1);
        debug!(
            cache = self.backend.name(),
            key,
            ttl_ms = ttl.map(saturating_millis),
            "Cache write"
        );
        Ok(())
    }

    /// Fetch and decode the value under `key`. Missing and expired entries
    /// are `Ok(None)`.
    pub async fn get<T>(&self, key: &(impl AsRef<str> + ?Sized)) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let key = key.as_ref();
        let wire_key = self.wire_key(key);
        let raw = self.observe("get", self.backend.get(&wire_key)).await?;

        let Some(raw) = raw else {
            counter!(METRIC_CACHE_MISS, "backend" => self.backend.name()).increment(1);
            return Ok(None);
        };
        counter!(METRIC_CACHE_HIT, "backend" => self.backend.name()).increment(1);
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| CacheError::serialization(key, err))
    }

    /// Delete a single entry. Removing a missing key is not an error.
    pub async fn remove(&self, key: &(impl AsRef<str> + ?Sized)) -> Result<(), CacheError> {
        let key = key.as_ref();
        let wire_key = self.wire_key(key);
        let removed = self.observe("remove", self.backend.remove(&wire_key)).await?;
        debug!(cache = self.backend.name(), key, removed, "Cache remove");
        Ok(())
    }

    /// Delete every entry in the namespace whose key matches `pattern` and
    /// return how many were removed.
    ///
    /// Walks the keyspace one scan page at a time and deletes each page with
    /// a single batched call before fetching the next.
    pub async fn flush(&self, pattern: &GlobPattern) -> Result<u64, CacheError> {
        let mut cursor: Option<String> = None;
        let mut removed = 0_u64;
        let mut pages = 0_u64;

        loop {
            let page = self
                .observe(
                    "flush.scan",
                    self.backend.scan(
                        cursor.as_deref(),
                        &self.namespace,
                        pattern,
                        self.scan_count.get(),
                    ),
                )
                .await?;
            pages += 1;

            if !page.keys.is_empty() {
                removed += self
                    .observe("flush.delete", self.backend.delete_many(&page.keys))
                    .await?;
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        counter!(METRIC_CACHE_FLUSH_REMOVED, "backend" => self.backend.name()).increment(removed);
        debug!(
            cache = self.backend.name(),
            pattern = %pattern,
            removed,
            pages,
            "Cache flush complete"
        );
        Ok(removed)
    }

    /// Round-trip to the backend.
    pub async fn ping(&self) -> Result<(), CacheError> {
        self.observe("ping", self.backend.ping()).await
    }

    fn wire_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}{key}", self.namespace)
        }
    }

    /// Apply the operation timeout and count unavailability.
    async fn observe<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        let result = bounded(self.operation_timeout, op, fut).await;
        match &result {
            Err(err) if err.is_unavailable() => {
                counter!(METRIC_CACHE_UNAVAILABLE, "backend" => self.backend.name(), "op" => op)
                    .increment(1);
                warn!(cache = self.backend.name(), op, error = %err, "Cache backend unavailable");
            }
            _ => {}
        }
        result
    }
}

async fn bounded<T>(
    limit: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, CacheError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::unavailable(
            op,
            format!("timed out after {}ms", limit.as_millis()),
        )),
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn store_with_namespace(namespace: &str) -> (CacheStore, Arc<MemoryBackend>) {
        let config = CacheConfig {
            namespace: namespace.to_string(),
            ..CacheConfig::memory()
        };
        let backend = Arc::new(MemoryBackend::new(config.capacity_non_zero()));
        (CacheStore::new(backend.clone(), &config), backend)
    }

    #[test]
    fn saturating_millis_clamps_huge_ttls() {
        assert_eq!(saturating_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn connect_reports_malformed_redis_address_as_unavailable() {
        let config = CacheConfig {
            backend: CacheBackendKind::Redis,
            host: "not a host".to_string(),
            operation_timeout_ms: 200,
            ..CacheConfig::default()
        };

        let err = CacheStore::connect(&config)
            .await
            .err()
            .expect("malformed address must not connect");
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn connect_reports_refused_redis_as_unavailable() {
        let config = CacheConfig {
            backend: CacheBackendKind::Redis,
            host: "127.0.0.1".to_string(),
            port: 1,
            operation_timeout_ms: 500,
            ..CacheConfig::default()
        };

        let err = CacheStore::connect(&config)
            .await
            .err()
            .expect("nothing listens on port 1");
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn namespace_is_applied_on_the_wire_only() {
        let (store, backend) = store_with_namespace("gw:");
        store.set("user:1", &json!({"id": 1}), None).await.unwrap();

        assert_eq!(
            backend.get("gw:user:1").await.unwrap().as_deref(),
            Some(r#"{"id":1}"#)
        );
        let value: Option<Value> = store.get("user:1").await.unwrap();
        assert_eq!(value, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn flush_is_confined_to_namespace() {
        let (store, backend) = store_with_namespace("gw:");
        store.set("test-1", &1, None).await.unwrap();
        backend.set("test-2", "2".into(), None).await.unwrap();

        assert_eq!(store.flush(&GlobPattern::all()).await.unwrap(), 1);
        assert!(backend.get("test-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flush_spans_multiple_pages() {
        let config = CacheConfig {
            scan_count: 2,
            ..CacheConfig::memory()
        };
        let store = CacheStore::in_memory(&config);
        for index in 0..7 {
            store.set(&format!("page-{index}"), &index, None).await.unwrap();
        }
        store.set("keep", &true, None).await.unwrap();

        assert_eq!(store.flush(&GlobPattern::new("page-*")).await.unwrap(), 7);
        assert_eq!(store.get::<bool>("keep").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn undecodable_value_is_a_serialization_error() {
        let store = CacheStore::in_memory(&CacheConfig::memory());
        store.set("k", &"text", None).await.unwrap();

        let err = store.get::<u32>("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization { ref key, .. } if key == "k"));
    }
}
