//! Cache configuration.
//!
//! Controls which backend the store talks to and how it behaves, via the
//! `[cache]` section of the settings file.

use std::{num::NonZeroUsize, time::Duration};

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_SCAN_COUNT: usize = 100;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 500;
const DEFAULT_CAPACITY: usize = 10_000;

/// Which store implementation backs the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Network key-value service speaking the Redis protocol.
    #[default]
    Redis,
    /// Bounded in-process LRU.
    Memory,
}

impl CacheBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
        }
    }
}

/// Cache store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub host: String,
    pub port: u16,
    /// Logical database index.
    pub database: i64,
    /// TTL applied when `set` is called without one. Zero means unbounded.
    pub default_ttl_seconds: u64,
    /// Multiplexed connections opened at startup.
    pub pool_size: usize,
    /// Keys requested per `SCAN` page during a flush.
    pub scan_count: usize,
    /// Upper bound for any single backend round-trip.
    pub operation_timeout_ms: u64,
    /// Prefix applied to every key on the wire.
    pub namespace: String,
    /// Entry limit for the in-process backend.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database: 0,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            pool_size: DEFAULT_POOL_SIZE,
            scan_count: DEFAULT_SCAN_COUNT,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            namespace: String::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            backend: settings.backend,
            host: settings.host.clone(),
            port: settings.port.get(),
            database: settings.database,
            default_ttl_seconds: settings.default_ttl_seconds,
            pool_size: settings.pool_size.get(),
            scan_count: settings.scan_count.get(),
            operation_timeout_ms: settings.operation_timeout_ms.get(),
            namespace: settings.namespace.clone(),
            capacity: settings.capacity.get(),
        }
    }
}

impl CacheConfig {
    /// In-process configuration, mostly for tests and single-node setups.
    pub fn memory() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            ..Self::default()
        }
    }

    /// Connection URL for the Redis backend.
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.database)
    }

    /// Returns the default TTL, or `None` when entries should not expire.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_seconds > 0).then(|| Duration::from_secs(self.default_ttl_seconds))
    }

    /// Returns the operation timeout, clamping to 1ms if zero.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }

    /// Returns the pool size as NonZeroUsize, clamping to 1 if zero.
    pub fn pool_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.pool_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the scan page size as NonZeroUsize, clamping to 1 if zero.
    pub fn scan_count_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.scan_count).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the in-process capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
