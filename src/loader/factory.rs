//! Per-request loader construction.

use std::{hash::Hash, num::NonZeroUsize, sync::Arc};

use serde::Deserialize;

use crate::backend::BatchFetch;

use super::{BatchLoader, ResultSink};

/// Loader configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Close a window once it holds this many keys. `None` or zero means
    /// windows are only closed by the scheduler or an explicit dispatch.
    pub max_batch_size: Option<usize>,
}

impl From<&crate::config::LoaderSettings> for LoaderConfig {
    fn from(settings: &crate::config::LoaderSettings) -> Self {
        Self {
            max_batch_size: settings.max_batch_size.map(NonZeroUsize::get),
        }
    }
}

impl LoaderConfig {
    pub fn max_batch_size_non_zero(&self) -> Option<NonZeroUsize> {
        self.max_batch_size.and_then(NonZeroUsize::new)
    }
}

/// Builds fresh loaders for each request.
///
/// Loaders hold a request's memo, so they must never be shared across
/// requests; the factory is the long-lived piece.
#[derive(Debug, Clone, Default)]
pub struct LoaderFactory {
    max_batch_size: Option<NonZeroUsize>,
}

impl LoaderFactory {
    pub fn new(config: &LoaderConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size_non_zero(),
        }
    }

    pub fn max_batch_size(&self) -> Option<NonZeroUsize> {
        self.max_batch_size
    }

    /// A new loader over `fetcher` for one request.
    pub fn for_request<K, V>(
        &self,
        name: &'static str,
        fetcher: Arc<dyn BatchFetch<K, V>>,
    ) -> BatchLoader<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        BatchLoader::builder(name, fetcher)
            .max_batch_size(self.max_batch_size)
            .build()
    }

    /// Like [`LoaderFactory::for_request`], with results of aborted windows
    /// handed to `sink`.
    pub fn for_request_with_sink<K, V>(
        &self,
        name: &'static str,
        fetcher: Arc<dyn BatchFetch<K, V>>,
        sink: Arc<dyn ResultSink<K, V>>,
    ) -> BatchLoader<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        BatchLoader::builder(name, fetcher)
            .max_batch_size(self.max_batch_size)
            .sink(sink)
            .build()
    }
}
