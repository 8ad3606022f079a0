//! Redis-protocol cache backend.
//!
//! Opens a fixed set of multiplexed connections at construction and hands
//! commands to them round-robin. Every command error is reported as
//! [`CacheError::Unavailable`]; the store bounds each call with its own
//! timeout on top of this.

use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use tracing::{debug, info};

use super::error::CacheError;
use super::keys::GlobPattern;
use super::store::{CacheBackend, ScanPage};

/// Round-robin pool of multiplexed Redis connections.
pub struct RedisBackend {
    connections: Vec<MultiplexedConnection>,
    next: AtomicUsize,
}

impl RedisBackend {
    /// Connect `pool_size` connections to `url` and verify them with `PING`.
    pub async fn connect(url: &str, pool_size: NonZeroUsize) -> Result<Self, CacheError> {
        let client = Client::open(url)
            .map_err(|err| CacheError::unavailable("connect", format!("invalid url: {err}")))?;

        let mut connections = Vec::with_capacity(pool_size.get());
        for _ in 0..pool_size.get() {
            let connection = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| redis_error("connect", err))?;
            connections.push(connection);
        }

        let backend = Self {
            connections,
            next: AtomicUsize::new(0),
        };
        backend.ping().await?;

        info!(
            cache = "redis",
            pool_size = pool_size.get(),
            "Connected to cache backend"
        );
        Ok(backend)
    }

    fn connection(&self) -> MultiplexedConnection {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index].clone()
    }
}

fn redis_error(op: &'static str, err: redis::RedisError) -> CacheError {
    CacheError::unavailable(op, err.to_string())
}

/// Milliseconds for `PX`, never below 1.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("get", err))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|err| redis_error("set", err))
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection();
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("remove", err))?;
        Ok(removed > 0)
    }

    async fn scan(
        &self,
        cursor: Option<&str>,
        prefix: &str,
        pattern: &GlobPattern,
        count: usize,
    ) -> Result<ScanPage, CacheError> {
        let cursor: u64 = match cursor {
            Some(raw) => raw.parse().map_err(|_| {
                CacheError::unavailable("scan", format!("invalid scan cursor `{raw}`"))
            })?,
            None => 0,
        };
        let pattern = pattern.to_redis_match(prefix);

        let mut conn = self.connection();
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("scan", err))?;

        debug!(cache = "redis", pattern = %pattern, cursor, next, matched = keys.len(), "Scanned page");
        Ok(ScanPage {
            keys,
            next: (next != 0).then(|| next.to_string()),
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("delete_many", err))
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("ping", err))?;
        if pong != "PONG" {
            return Err(CacheError::unavailable(
                "ping",
                format!("unexpected reply `{pong}`"),
            ));
        }
        Ok(())
    }
}
