//! Request-scoped batch loading and a shared TTL cache for API gateways.
//!
//! - [`cache`]: the shared store and the read-through/invalidate middleware.
//! - [`loader`]: per-request coalescing of entity lookups into batched calls.
//! - [`backend`]: the contracts downstream services are reached through.
//! - [`context`]: per-request ownership of loaders.

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod infra;
pub mod loader;
mod util;
