use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Cache contract
// ---------------------------------------------------------------------------

/// Optional cache collaborator consumed by the engine and by plugins that
/// support caching. Misses and absence are "no cache", never errors, which
/// is why every operation is infallible at the trait level.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Fetch a value; `None` on miss or expiry.
    async fn get(&self, key: &str) -> Option<Value>;

    /// Store a value with an optional time-to-live.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Remove a key. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> bool;

    /// Whether a live (non-expired) entry exists.
    async fn has(&self, key: &str) -> bool;
}

// ---------------------------------------------------------------------------
// MemoryCache
// ---------------------------------------------------------------------------

struct Entry {
    value: Value,
    inserted: Instant,
    expires_at: Option<Instant>,
}

/// In-process cache with TTL expiry and oldest-first eviction once the entry
/// cap is reached. The default cache handle for analysis contexts.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of live entries (expired entries still pending sweep count).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_oldest(entries: &mut HashMap<String, Entry>) {
        if let Some(key) = entries
            .iter()
            .min_by_key(|(_, e)| e.inserted)
            .map(|(k, _)| k.clone())
        {
            entries.remove(&key);
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(e) if e.expires_at.is_some_and(|at| at <= Instant::now()) => {
                entries.remove(key);
                None
            }
            Some(e) => Some(e.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            Self::evict_oldest(&mut entries);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted: Instant::now(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.remove(key).is_some()
    }

    async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
