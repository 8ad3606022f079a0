use thiserror::Error;

/// Errors surfaced by the cache store.
///
/// Neither variant is fatal to a request: the middleware degrades both to a
/// cache miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached or did not answer in time.
    #[error("cache unavailable during `{op}`: {message}")]
    Unavailable { op: &'static str, message: String },
    /// A value could not be encoded for storage or decoded on the way out.
    #[error("cache value for `{key}` could not be (de)serialized: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn unavailable(op: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            op,
            message: message.into(),
        }
    }

    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }

    /// True for transport failures (as opposed to bad payloads).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

