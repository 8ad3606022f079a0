//! Bounded in-process cache backend.
//!
//! Entries live in an LRU keyed by their full (namespaced) key. A sorted key
//! index sits next to it so a scan page only touches the keys it returns.
//! Expiry is checked lazily: on read, and while scanning for a flush.

use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    ops::Bound,
    sync::RwLock,
    time::Duration,
};

use async_trait::async_trait;
use lru::LruCache;
use tokio::time::Instant;

use crate::util::lock::{rw_read, rw_write};

use super::error::CacheError;
use super::keys::GlobPattern;
use super::store::{CacheBackend, ScanPage};

const SOURCE: &str = "cache::memory";

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// LRU plus the ordered set of its keys. Both change together.
struct Entries {
    lru: LruCache<String, Entry>,
    index: BTreeSet<String>,
}

impl Entries {
    fn insert(&mut self, key: String, entry: Entry) {
        if let Some((evicted, _)) = self.lru.push(key.clone(), entry) {
            if evicted != key {
                self.index.remove(&evicted);
            }
        }
        self.index.insert(key);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.index.remove(key);
        self.lru.pop(key).is_some()
    }
}

/// In-process LRU backend.
pub struct MemoryBackend {
    entries: RwLock<Entries>,
}

impl MemoryBackend {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(Entries {
                lru: LruCache::new(capacity),
                index: BTreeSet::new(),
            }),
        }
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let found = entries
            .lru
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match found {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        rw_write(&self.entries, SOURCE, "set").insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(rw_write(&self.entries, SOURCE, "remove").remove(key))
    }

    /// Visits at most `count` keys in key order, starting after `cursor`.
    /// A page may hold fewer matches than it visited, or none at all.
    async fn scan(
        &self,
        cursor: Option<&str>,
        prefix: &str,
        pattern: &GlobPattern,
        count: usize,
    ) -> Result<ScanPage, CacheError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "scan");

        let lower = match cursor {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let mut candidates = entries
            .index
            .range::<str, _>((lower, Bound::Unbounded))
            .take_while(|key| key.starts_with(prefix));
        let visited: Vec<String> = candidates.by_ref().take(count).cloned().collect();
        let has_more = candidates.next().is_some();

        let match_all = pattern.is_match_all();
        let mut matched = Vec::new();
        for key in &visited {
            let live = entries.lru.peek(key.as_str()).map(|entry| entry.is_live(now));
            match live {
                Some(true) => {
                    if match_all || pattern.matches(&key[prefix.len()..]) {
                        matched.push(key.clone());
                    }
                }
                Some(false) => {
                    entries.remove(key);
                }
                None => {}
            }
        }

        let next = if has_more { visited.last().cloned() } else { None };
        Ok(ScanPage {
            keys: matched,
            next,
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete_many");
        let removed = keys.iter().filter(|key| entries.remove(key)).count();
        Ok(removed as u64)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(capacity: usize) -> MemoryBackend {
        MemoryBackend::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    async fn scan_all(backend: &MemoryBackend, pattern: &GlobPattern, count: usize) -> Vec<ScanPage> {
        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = backend
                .scan(cursor.as_deref(), "", pattern, count)
                .await
                .unwrap();
            cursor = page.next.clone();
            pages.push(page);
            if cursor.is_none() {
                return pages;
            }
        }
    }

    #[tokio::test]
    async fn lru_evicts_least_recently_used() {
        let backend = backend(2);
        backend.set("a", "1".into(), None).await.unwrap();
        backend.set("b", "2".into(), None).await.unwrap();
        // Touch `a` so `b` becomes the eviction candidate.
        assert!(backend.get("a").await.unwrap().is_some());
        backend.set("c", "3".into(), None).await.unwrap();

        assert!(backend.get("a").await.unwrap().is_some());
        assert!(backend.get("b").await.unwrap().is_none());
        assert!(backend.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn evicted_keys_leave_the_scan_index() {
        let backend = backend(2);
        for key in ["a", "b", "c"] {
            backend.set(key, "x".into(), None).await.unwrap();
        }
        // Overwriting a live key must not drop it from the index.
        backend.set("c", "y".into(), None).await.unwrap();

        let page = backend.scan(None, "", &GlobPattern::all(), 10).await.unwrap();
        assert_eq!(page.keys, vec!["b", "c"]);
        assert!(page.next.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_dropped_on_read() {
        let backend = backend(8);
        backend
            .set("k", "v".into(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(backend.get("k").await.unwrap().is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn match_all_scan_returns_every_key_under_prefix() {
        let backend = backend(8);
        for key in ["ns:", "ns:a", "ns:b*c", "other:a"] {
            backend.set(key, "x".into(), None).await.unwrap();
        }

        let page = backend.scan(None, "ns:", &GlobPattern::new("**"), 8).await.unwrap();
        assert_eq!(page.keys, vec!["ns:", "ns:a", "ns:b*c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_dropped_while_scanning() {
        let backend = backend(8);
        backend
            .set("old", "v".into(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        backend.set("new", "v".into(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let page = backend.scan(None, "", &GlobPattern::all(), 10).await.unwrap();
        assert_eq!(page.keys, vec!["new"]);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn scan_pages_through_matches_in_key_order() {
        let backend = backend(16);
        for key in ["ns:test-3", "ns:test-1", "ns:prod-1", "ns:test-2", "other:test-9"] {
            backend.set(key, "x".into(), None).await.unwrap();
        }
        let pattern = GlobPattern::new("test*");

        // `ns:prod-1` is visited but does not match.
        let first = backend.scan(None, "ns:", &pattern, 2).await.unwrap();
        assert_eq!(first.keys, vec!["ns:test-1"]);
        let cursor = first.next.expect("more pages");
        assert_eq!(cursor, "ns:test-1");

        let second = backend
            .scan(Some(&cursor), "ns:", &pattern, 2)
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["ns:test-2", "ns:test-3"]);
        assert!(second.next.is_none());
    }

    #[tokio::test]
    async fn each_page_visits_at_most_count_keys() {
        let backend = backend(128);
        for index in 0..50 {
            backend
                .set(&format!("miss-{index:02}"), "x".into(), None)
                .await
                .unwrap();
        }
        backend.set("zzz-hit", "x".into(), None).await.unwrap();

        let pattern = GlobPattern::new("zzz*");
        let first = backend.scan(None, "", &pattern, 5).await.unwrap();
        assert!(first.keys.is_empty());
        assert_eq!(first.next.as_deref(), Some("miss-04"));

        let pages = scan_all(&backend, &pattern, 5).await;
        // 51 keys, five per page.
        assert_eq!(pages.len(), 11);
        let hits: Vec<&String> = pages.iter().flat_map(|page| &page.keys).collect();
        assert_eq!(hits, vec!["zzz-hit"]);
    }

    #[tokio::test]
    async fn delete_many_counts_only_present_keys() {
        let backend = backend(4);
        backend.set("a", "1".into(), None).await.unwrap();
        let removed = backend
            .delete_many(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!backend.remove("a").await.unwrap());
        let page = backend.scan(None, "", &GlobPattern::all(), 4).await.unwrap();
        assert!(page.keys.is_empty());
    }
}
