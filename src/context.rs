//! Per-request state.
//!
//! A `RequestContext` is created when a request enters the gateway and dropped
//! when it leaves. Loaders built through it live exactly as long as the
//! request; dropping the context aborts any loads still pending.

use std::{
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::backend::BatchFetch;
use crate::cache::{CacheKey, CacheMiddleware};
use crate::loader::{Abort, BatchLoader, LoaderFactory};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "context";

pub struct RequestContext {
    id: Uuid,
    middleware: Arc<CacheMiddleware>,
    factory: LoaderFactory,
    loaders: Mutex<Vec<Box<dyn Abort>>>,
}

impl RequestContext {
    pub fn new(middleware: Arc<CacheMiddleware>, factory: LoaderFactory) -> Self {
        Self {
            id: Uuid::new_v4(),
            middleware,
            factory,
            loaders: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn middleware(&self) -> &CacheMiddleware {
        &self.middleware
    }

    /// A loader scoped to this request.
    pub fn loader<K, V>(&self, name: &'static str, fetcher: Arc<dyn BatchFetch<K, V>>) -> BatchLoader<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let loader = self.factory.for_request(name, fetcher);
        self.register(&loader);
        loader
    }

    /// A loader scoped to this request whose results survive an abort: records
    /// fetched after the request went away are written to the cache under
    /// `key_of(key)`.
    pub fn cached_loader<K, V, F>(
        &self,
        name: &'static str,
        fetcher: Arc<dyn BatchFetch<K, V>>,
        ttl: Option<Duration>,
        key_of: F,
    ) -> BatchLoader<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Serialize + Clone + Send + Sync + 'static,
        F: Fn(&K) -> CacheKey + Send + Sync + 'static,
    {
        let sink = self.middleware.result_sink(ttl, key_of);
        let loader = self.factory.for_request_with_sink(name, fetcher, sink);
        self.register(&loader);
        loader
    }

    /// Reject every pending load made through this context.
    pub fn abort(&self) {
        let loaders = mutex_lock(&self.loaders, SOURCE, "abort");
        for loader in loaders.iter() {
            loader.abort();
        }
        debug!(request_id = %self.id, loaders = loaders.len(), "Request aborted");
    }

    fn register<K, V>(&self, loader: &BatchLoader<K, V>)
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        mutex_lock(&self.loaders, SOURCE, "register").push(Box::new(loader.clone()));
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.abort();
    }
}
