//! Capacity- and time-bounded memoisation of upstream results.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheSettings;

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tick: u64,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl<V> CacheState<V> {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    /// Refreshes recency and expiry of a live entry; drops it if expired.
    fn touch(&mut self, key: &str, ttl: Duration, now: Instant) -> Option<&CacheEntry<V>> {
        let expired = self.entries.get(key)?.expires_at <= now;
        if expired {
            self.remove(key);
            return None;
        }

        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.tick, tick);
        entry.expires_at = now + ttl;
        self.recency.remove(&previous);
        self.recency.insert(tick, key.to_string());
        self.entries.get(key)
    }
}

/// LRU cache with sliding time-to-live.
///
/// A disabled cache accepts every call and never stores anything, so callers
/// do not need to branch on whether caching is on.
#[derive(Debug)]
pub struct BoundedCache<V> {
    enabled: bool,
    max_entries: usize,
    ttl: Duration,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            max_entries: settings.max_entries.max(1),
            ttl: settings.ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(&CacheSettings {
            enabled: false,
            ..CacheSettings::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<V> {
        if !self.enabled {
            return None;
        }

        let mut state = self.lock();
        let value = state
            .touch(key, self.ttl, Instant::now())
            .map(|entry| entry.value.clone());
        if value.is_some() {
            debug!(key = %key, "cache hit");
        }
        value
    }

    pub fn has(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }

        self.lock().touch(key, self.ttl, Instant::now()).is_some()
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if !self.enabled {
            return;
        }

        let key = key.into();
        let mut state = self.lock();
        state.remove(&key);

        let tick = state.bump();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
                tick,
            },
        );

        while state.entries.len() > self.max_entries {
            let Some((_, oldest)) = state.recency.pop_first() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!(key = %oldest, "cache evicted least recently used entry");
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }

        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        // Poisoning is ignored; every mutation leaves the maps consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Builds a key that is identical for identical logical requests, whatever
/// order the parameters were inserted in.
pub fn create_key(prefix: &str, params: &Map<String, Value>) -> String {
    let mut pairs = params
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>();
    pairs.sort();

    format!("{prefix}:{}", pairs.join("&"))
}
