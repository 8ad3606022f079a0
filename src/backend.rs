//! Downstream service contracts.
//!
//! The RPC transport lives outside this crate. Services are reached through
//! two narrow traits: ordered batch reads and single-record mutations.

use std::{collections::HashMap, future::Future, hash::Hash};

use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by (or about) a downstream service call.
///
/// Cloneable so one failed batch can reject every handle waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend `{service}` failed: {message}")]
    Rpc { service: String, message: String },
    #[error("backend returned {actual} results for {expected} keys")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("`{service}` has no record `{id}`")]
    NotFound { service: String, id: String },
}

impl BackendError {
    pub fn rpc(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn not_found(service: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            service: service.into(),
            id: id.to_string(),
        }
    }
}

/// Ordered batch read.
///
/// Implementations must return exactly one entry per key, in key order;
/// `None` marks a key the service does not know.
#[async_trait]
pub trait BatchFetch<K, V>: Send + Sync {
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<Option<V>>, BackendError>;
}

/// Single-record mutation.
#[async_trait]
pub trait Mutate: Send + Sync {
    type Id: Send;
    type Changes: Send;
    type Record: Send;

    async fn mutate(
        &self,
        id: Self::Id,
        changes: Self::Changes,
    ) -> Result<Self::Record, BackendError>;
}

/// Adapts an unordered "find all by ids" call into [`BatchFetch`].
///
/// Rows are matched back to the requested keys with `key_of`; ids the service
/// did not return come back as `None`. If a key appears in several rows the
/// first one wins.
pub struct KeyedFetch<F, X> {
    find_all: F,
    key_of: X,
}

impl<F, X> KeyedFetch<F, X> {
    pub fn new(find_all: F, key_of: X) -> Self {
        Self { find_all, key_of }
    }
}

#[async_trait]
impl<K, V, F, Fut, X> BatchFetch<K, V> for KeyedFetch<F, X>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(Vec<K>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<V>, BackendError>> + Send,
    X: Fn(&V) -> K + Send + Sync,
{
    async fn fetch_many(&self, keys: &[K]) -> Result<Vec<Option<V>>, BackendError> {
        let rows = (self.find_all)(keys.to_vec()).await?;

        let mut by_key: HashMap<K, V> = HashMap::with_capacity(rows.len());
        for row in rows {
            by_key.entry((self.key_of)(&row)).or_insert(row);
        }

        Ok(keys.iter().map(|key| by_key.get(key).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct User {
        id: u32,
        name: &'static str,
    }

    #[tokio::test]
    async fn keyed_fetch_realigns_unordered_rows() {
        let fetch = KeyedFetch::new(
            |ids: Vec<u32>| async move {
                // Rows come back in reverse and without id 2.
                let mut rows: Vec<User> = ids
                    .into_iter()
                    .filter(|id| *id != 2)
                    .map(|id| User { id, name: "u" })
                    .collect();
                rows.reverse();
                Ok::<_, BackendError>(rows)
            },
            |user: &User| user.id,
        );

        let results = fetch.fetch_many(&[1, 2, 3]).await.expect("fetch");
        let ids: Vec<Option<u32>> = results.iter().map(|row| row.as_ref().map(|u| u.id)).collect();
        assert_eq!(ids, vec![Some(1), None, Some(3)]);
    }

    #[tokio::test]
    async fn keyed_fetch_keeps_first_duplicate_row() {
        let fetch = KeyedFetch::new(
            |_ids: Vec<u32>| async move {
                Ok::<_, BackendError>(vec![
                    User { id: 1, name: "first" },
                    User { id: 1, name: "second" },
                ])
            },
            |user: &User| user.id,
        );

        let results = fetch.fetch_many(&[1]).await.expect("fetch");
        assert_eq!(results[0].as_ref().map(|u| u.name), Some("first"));
    }

    #[tokio::test]
    async fn keyed_fetch_propagates_errors() {
        let fetch = KeyedFetch::new(
            |_ids: Vec<u32>| async move { Err::<Vec<User>, _>(BackendError::rpc("users", "down")) },
            |user: &User| user.id,
        );

        let err = fetch.fetch_many(&[1]).await.unwrap_err();
        assert_eq!(err, BackendError::rpc("users", "down"));
    }
}
