use std::path::Path;
use std::time::{Duration, Instant};

use dashmap::DashMap;

const TREE_PREFIX: &str = "tree:";
const FILE_PREFIX: &str = "file:";

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    data: T,
    timestamp: Instant,
}

/// Short-lived memoization of read results, keyed by operation and path
pub struct ResultCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    ttl: Duration,
}

impl<T: Clone> ResultCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    /// Lookup as of `now`; stale entries are evicted and reported absent
    pub fn get_at(&self, key: &str, now: Instant) -> Option<T> {
        let stale = {
            let entry = self.entries.get(key)?;
            if now.saturating_duration_since(entry.timestamp) < self.ttl {
                return Some(entry.data.clone());
            }
            entry.timestamp
        };
        self.entries
            .remove_if(key, |_, entry| entry.timestamp == stale);
        None
    }

    pub fn set(&self, key: String, data: T) {
        self.set_at(key, data, Instant::now());
    }

    pub fn set_at(&self, key: String, data: T, timestamp: Instant) {
        self.entries.insert(key, CacheEntry { data, timestamp });
    }

    /// Drop entries for `path` and everything below it
    pub fn invalidate(&self, path: &Path) {
        self.entries.retain(|key, _| match key_path(key) {
            Some(cached) => !Path::new(cached).starts_with(path),
            None => true,
        });
    }

    /// Drop tree entries of every directory containing `path`
    pub fn invalidate_ancestors(&self, path: &Path) {
        self.entries.retain(|key, _| {
            if !key.starts_with(TREE_PREFIX) {
                return true;
            }
            match key_path(key) {
                Some(cached) => !path.starts_with(cached),
                None => true,
            }
        });
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn tree_key(path: &Path, depth: &str) -> String {
    format!("{}{}:{}", TREE_PREFIX, path.display(), depth)
}

pub fn file_key(path: &Path) -> String {
    format!("{}{}", FILE_PREFIX, path.display())
}

/// The path embedded in a cache key
fn key_path(key: &str) -> Option<&str> {
    if let Some(rest) = key.strip_prefix(TREE_PREFIX) {
        return rest.rsplit_once(':').map(|(path, _depth)| path);
    }
    key.strip_prefix(FILE_PREFIX)
}
