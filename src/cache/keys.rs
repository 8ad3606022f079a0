//! Cache key definitions.
//!
//! Keys are plain strings on the wire. `CacheKey` builds them deterministically
//! from either an entity reference (`user:42`) or an operation name plus its
//! arguments (`users.list:<sha256 of normalized args>`). `GlobPattern` selects
//! groups of keys for bulk invalidation.

use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Identifies one cacheable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-formed key.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for a single entity, e.g. `user:42`.
    pub fn entity(kind: &str, id: impl fmt::Display) -> Self {
        Self(format!("{kind}:{id}"))
    }

    /// Key for an operation invoked with the given arguments.
    ///
    /// Object keys inside `args` are sorted before hashing, so two logically
    /// identical argument sets always produce the same key.
    pub fn operation(name: &str, args: &Value) -> Self {
        Self(format!("{name}:{}", hash_args(args)))
    }

    /// Pattern matching every key produced by [`CacheKey::operation`] for `name`.
    pub fn operation_pattern(name: &str) -> GlobPattern {
        GlobPattern::new(format!("{name}:*"))
    }

    /// Pattern matching every entity key of `kind`.
    pub fn entity_pattern(kind: &str) -> GlobPattern {
        GlobPattern::new(format!("{kind}:*"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

// ============================================================================
// Argument normalization
// ============================================================================

/// Recursively rebuild `value` with object keys in sorted order.
pub fn normalize_args(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key.clone(), normalize_args(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_args).collect()),
        other => other.clone(),
    }
}

/// SHA-256 (hex) of the normalized JSON form of `args`.
pub fn hash_args(args: &Value) -> String {
    let normalized = normalize_args(args);
    let mut hasher = Sha256::new();
    // Serializing a `Value` cannot fail.
    hasher.update(normalized.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Glob patterns
// ============================================================================

/// Glob pattern over cache keys.
///
/// `*` matches any substring (including the empty one); every other character
/// matches itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    raw: String,
}

impl GlobPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Pattern matching every key.
    pub fn all() -> Self {
        Self::new("*")
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the pattern matches every key.
    pub fn is_match_all(&self) -> bool {
        !self.raw.is_empty() && self.raw.chars().all(|c| c == '*')
    }

    pub fn matches(&self, key: &str) -> bool {
        let parts: Vec<&str> = self.raw.split('*').collect();
        if parts.len() == 1 {
            return key == self.raw;
        }

        let first = parts[0];
        let last = parts[parts.len() - 1];
        if key.len() < first.len() + last.len() {
            return false;
        }
        if !key.starts_with(first) || !key.ends_with(last) {
            return false;
        }

        let mut rest = &key[first.len()..key.len() - last.len()];
        for middle in &parts[1..parts.len() - 1] {
            if middle.is_empty() {
                continue;
            }
            match rest.find(middle) {
                Some(index) => rest = &rest[index + middle.len()..],
                None => return false,
            }
        }
        true
    }

    /// Render as a Redis `MATCH` pattern under `namespace`.
    ///
    /// Redis globs also treat `?`, `[`, `]` and `\` specially; those are
    /// escaped so they match literally.
    pub fn to_redis_match(&self, namespace: &str) -> String {
        let mut out = String::with_capacity(namespace.len() + self.raw.len());
        escape_redis_literal(namespace, &mut out);
        for (index, part) in self.raw.split('*').enumerate() {
            if index > 0 {
                out.push('*');
            }
            escape_redis_literal(part, &mut out);
        }
        out
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for GlobPattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for GlobPattern {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

fn escape_redis_literal(literal: &str, out: &mut String) {
    for c in literal.chars() {
        if matches!(c, '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn entity_key_format() {
        assert_eq!(CacheKey::entity("user", 42).as_str(), "user:42");
        assert_eq!(CacheKey::entity("comment", "c-1").to_string(), "comment:c-1");
    }

    #[test]
    fn operation_key_ignores_argument_order() {
        let a = CacheKey::operation(
            "users.list",
            &json!({"where": {"role": "admin", "active": true}, "limit": 10}),
        );
        let b = CacheKey::operation(
            "users.list",
            &json!({"limit": 10, "where": {"active": true, "role": "admin"}}),
        );
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("users.list:"));
    }

    #[test]
    fn operation_key_differs_for_different_arguments() {
        let a = CacheKey::operation("users.list", &json!({"limit": 10}));
        let b = CacheKey::operation("users.list", &json!({"limit": 11}));
        let c = CacheKey::operation("posts.list", &json!({"limit": 10}));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn array_order_is_significant() {
        let a = CacheKey::operation("users.byIds", &json!({"ids": [1, 2]}));
        let b = CacheKey::operation("users.byIds", &json!({"ids": [2, 1]}));
        assert_ne!(a, b);
    }

    #[test]
    fn operation_pattern_matches_its_keys() {
        let key = CacheKey::operation("users.list", &json!({}));
        assert!(CacheKey::operation_pattern("users.list").matches(key.as_str()));
        assert!(!CacheKey::operation_pattern("posts.list").matches(key.as_str()));
        assert!(CacheKey::entity_pattern("user").matches("user:7"));
    }

    #[test]
    fn glob_prefix_and_exact() {
        let prefix = GlobPattern::new("test*");
        assert!(prefix.matches("test-1"));
        assert!(prefix.matches("test"));
        assert!(!prefix.matches("prod-1"));

        let exact = GlobPattern::new("user:1");
        assert!(exact.matches("user:1"));
        assert!(!exact.matches("user:10"));
    }

    #[test]
    fn glob_infix_and_suffix() {
        let pattern = GlobPattern::new("*:list:*");
        assert!(pattern.matches("users:list:abc"));
        assert!(!pattern.matches("users:item:abc"));

        let suffix = GlobPattern::new("*-draft");
        assert!(suffix.matches("post-draft"));
        assert!(!suffix.matches("post-draft-2"));

        let overlapping = GlobPattern::new("ab*ba");
        assert!(!overlapping.matches("aba"));
        assert!(overlapping.matches("abba"));
    }

    #[test]
    fn glob_match_all() {
        assert!(GlobPattern::all().is_match_all());
        assert!(GlobPattern::new("**").is_match_all());
        assert!(!GlobPattern::new("a*").is_match_all());
        assert!(GlobPattern::all().matches(""));
        assert!(GlobPattern::all().matches("anything"));
    }

    #[test]
    fn redis_match_escapes_special_characters() {
        let pattern = GlobPattern::new("user?[x]*");
        assert_eq!(pattern.to_redis_match("gw:"), "gw:user\\?\\[x\\]*");
        assert_eq!(GlobPattern::all().to_redis_match(""), "*");
    }
}
