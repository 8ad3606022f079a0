//! Shared response cache.
//!
//! - **Store**: TTL-bounded key/value storage with glob flush, backed by Redis
//!   or an in-process LRU.
//! - **Middleware**: read-through and invalidate-on-write around resolver
//!   calls.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! host = "127.0.0.1"
//! port = 6379
//! default_ttl_seconds = 300
//! namespace = "gw:"
//! # ... see config.rs for all options
//! ```

mod config;
mod error;
mod keys;
mod memory;
mod middleware;
mod redis;
mod store;

pub use config::{CacheBackendKind, CacheConfig};
pub use error::CacheError;
pub use keys::{CacheKey, GlobPattern, hash_args, normalize_args};
pub use memory::MemoryBackend;
pub use middleware::{CacheMiddleware, Invalidation, MiddlewareConfig, Resolution};
pub use redis::RedisBackend;
pub use store::{CacheBackend, CacheStore, ScanPage};
