//! In-process backing store used when Redis is disabled or unreachable.
//!
//! Mirrors the subset of Redis semantics the cache relies on: byte values
//! and string sets, per-key expiry, glob pattern scans. Expired entries are
//! removed lazily on access, and in bulk by the task started with
//! [`LocalStore::start_cleanup_task`].

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::KeyTtl;
use super::pattern::glob_to_regex;

#[derive(Debug, Clone)]
enum LocalValue {
    Bytes(Arc<Vec<u8>>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    /// `None` when the expiry lies beyond what `Instant` can represent.
    expires_at: Option<Instant>,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn size_bytes(&self) -> u64 {
        match &self.value {
            LocalValue::Bytes(data) => data.len() as u64,
            LocalValue::Set(members) => members.iter().map(|m| m.len() as u64).sum(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes `key` if it has expired and reports whether it is still live.
    fn evict_if_expired(&self, key: &str, now: Instant) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.is_expired(now))
            .is_some();
        !removed && self.entries.contains_key(key)
    }

    pub fn get_bytes(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let now = Instant::now();
        if !self.evict_if_expired(key, now) {
            return None;
        }
        self.entries.get(key).and_then(|entry| match &entry.value {
            LocalValue::Bytes(data) => Some(Arc::clone(data)),
            LocalValue::Set(_) => None,
        })
    }

    pub fn set_bytes(&self, key: &str, data: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value: LocalValue::Bytes(Arc::new(data)),
                expires_at: Instant::now().checked_add(ttl),
            },
        );
    }

    /// Deletes the given keys, returning how many live entries were removed.
    pub fn delete(&self, keys: &[String]) -> u64 {
        let now = Instant::now();
        keys.iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| !entry.is_expired(now))
            .count() as u64
    }

    /// Returns live keys matching a glob pattern.
    pub fn scan(&self, pattern: &str) -> Vec<String> {
        let matcher = match glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "invalid key pattern");
                return Vec::new();
            }
        };
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now) && matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.evict_if_expired(key, Instant::now())
    }

    pub fn ttl(&self, key: &str) -> KeyTtl {
        let now = Instant::now();
        if !self.evict_if_expired(key, now) {
            return KeyTtl::Missing;
        }
        match self.entries.get(key).map(|entry| entry.expires_at) {
            None => KeyTtl::Missing,
            Some(None) => KeyTtl::Persistent,
            Some(Some(at)) => KeyTtl::Expires(at.saturating_duration_since(now)),
        }
    }

    /// Adds members to a set and refreshes the set's expiry.
    pub fn add_to_set(&self, key: &str, members: &[String], ttl: Duration) {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl);
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| LocalEntry {
            value: LocalValue::Set(HashSet::new()),
            expires_at,
        });
        if entry.is_expired(now) || !matches!(entry.value, LocalValue::Set(_)) {
            entry.value = LocalValue::Set(HashSet::new());
        }
        entry.expires_at = expires_at;
        if let LocalValue::Set(set) = &mut entry.value {
            set.extend(members.iter().cloned());
        }
    }

    pub fn set_members(&self, key: &str) -> Vec<String> {
        if !self.evict_if_expired(key, Instant::now()) {
            return Vec::new();
        }
        self.entries
            .get(key)
            .map(|entry| match &entry.value {
                LocalValue::Set(set) => set.iter().cloned().collect(),
                LocalValue::Bytes(_) => Vec::new(),
            })
            .unwrap_or_default()
    }

    /// Removes members from a set; an emptied set is deleted, as in Redis.
    pub fn remove_from_set(&self, key: &str, members: &[String]) {
        let emptied = match self.entries.get_mut(key) {
            Some(mut entry) => match &mut entry.value {
                LocalValue::Set(set) => {
                    for member in members {
                        set.remove(member);
                    }
                    set.is_empty()
                }
                LocalValue::Bytes(_) => false,
            },
            None => false,
        };
        if emptied {
            self.entries
                .remove_if(key, |_, entry| matches!(&entry.value, LocalValue::Set(s) if s.is_empty()));
        }
    }

    /// Approximate payload size of all live entries.
    pub fn memory_bytes(&self) -> u64 {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().len() as u64 + entry.value().size_bytes())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry, returning the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let removed = self.cleanup_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = self.len(), "expired local cache entries swept");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let store = LocalStore::new();
        store.set_bytes("k", b"v".to_vec(), Duration::from_secs(60));
        assert_eq!(store.get_bytes("k"), Some(Arc::new(b"v".to_vec())));
        assert!(store.exists("k"));
    }

    #[test]
    fn test_expiration() {
        let store = LocalStore::new();
        store.set_bytes("k", b"v".to_vec(), Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get_bytes("k").is_none());
        assert!(!store.exists("k"));
        assert_eq!(store.ttl("k"), KeyTtl::Missing);
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_counts_only_live_keys() {
        let store = LocalStore::new();
        store.set_bytes("a", b"1".to_vec(), Duration::from_secs(60));
        let removed = store.delete(&["a".to_string(), "missing".to_string()]);
        assert_eq!(removed, 1);
        assert_eq!(store.delete(&["a".to_string()]), 0);
    }

    #[test]
    fn test_scan_matches_pattern() {
        let store = LocalStore::new();
        for key in ["suites:list:skip:0:limit:10", "suites:list:skip:10:limit:10", "suite:1"] {
            store.set_bytes(key, b"x".to_vec(), Duration::from_secs(60));
        }
        let mut keys = store.scan("suites:list:*");
        keys.sort();
        assert_eq!(
            keys,
            vec!["suites:list:skip:0:limit:10", "suites:list:skip:10:limit:10"]
        );
    }

    #[test]
    fn test_ttl_reports_remaining_time() {
        let store = LocalStore::new();
        store.set_bytes("k", b"v".to_vec(), Duration::from_secs(60));
        match store.ttl("k") {
            KeyTtl::Expires(left) => assert!(left <= Duration::from_secs(60) && left.as_secs() >= 59),
            other => panic!("unexpected ttl: {other:?}"),
        }
    }

    #[test]
    fn test_sets() {
        let store = LocalStore::new();
        store.add_to_set("tag:suite", &["a".into(), "b".into()], Duration::from_secs(60));
        store.add_to_set("tag:suite", &["b".into(), "c".into()], Duration::from_secs(60));
        let mut members = store.set_members("tag:suite");
        members.sort();
        assert_eq!(members, vec!["a", "b", "c"]);

        store.remove_from_set("tag:suite", &["a".into(), "b".into(), "c".into()]);
        assert!(store.set_members("tag:suite").is_empty());
        assert!(!store.exists("tag:suite"));
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let store = LocalStore::new();
        store.set_bytes("k", b"v".to_vec(), Duration::MAX);
        store.add_to_set("tag:suite", &["k".into()], Duration::MAX);
        assert_eq!(store.get_bytes("k"), Some(Arc::new(b"v".to_vec())));
        assert_eq!(store.ttl("k"), KeyTtl::Persistent);
        assert_eq!(store.set_members("tag:suite"), vec!["k"]);
    }

    #[tokio::test]
    async fn test_cleanup_task_sweeps_unread_entries() {
        let store = Arc::new(LocalStore::new());
        store.set_bytes("memo:x", b"v".to_vec(), Duration::from_millis(10));
        store.add_to_set("tag:stale", &["memo:x".into()], Duration::from_millis(10));
        store.set_bytes("live", b"v".to_vec(), Duration::from_secs(60));

        let task = Arc::clone(&store).start_cleanup_task(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(store.len(), 1);
        assert!(store.exists("live"));
    }

    #[test]
    fn test_cleanup_expired() {
        let store = LocalStore::new();
        for i in 0..3 {
            store.set_bytes(&format!("k{i}"), b"v".to_vec(), Duration::from_millis(10));
        }
        store.set_bytes("live", b"v".to_vec(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.cleanup_expired(), 3);
        assert_eq!(store.len(), 1);
    }
}
