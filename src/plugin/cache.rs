//! TTL cache for loaded plugins
//!
//! Entries expire `ttl` after they were last used; every successful lookup
//! slides the deadline. Expiry is lazy: an expired entry is removed by the
//! lookup that finds it and handed back so the caller can terminate whatever
//! it owns. The cache itself is not synchronized; the plugin manager keeps it
//! behind an `RwLock`.

use crate::core::time::TimeProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// A cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub inserted_at: Instant,
    pub last_used: Instant,
    pub expires_at: Option<Instant>,
    /// Wall-clock time of the last use, for display
    pub last_used_at: SystemTime,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    Hit(V),
    /// The entry had expired and was removed
    Expired(V),
    Miss,
}

/// Map of values that expire after a period without use
pub struct TtlCache<V> {
    ttl: Duration,
    time: Arc<dyn TimeProvider>,
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        f.debug_struct("TtlCache")
            .field("ttl", &self.ttl)
            .field("keys", &keys)
            .finish()
    }
}

impl<V: Clone> TtlCache<V> {
    /// A zero `ttl` keeps entries until they are removed explicitly
    pub fn new(ttl: Duration, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            ttl,
            time,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn deadline(&self, from: Instant) -> Option<Instant> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(from + self.ttl)
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        entry.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Insert or replace; returns the replaced value
    pub fn put(&mut self, key: &str, value: V) -> Option<V> {
        let now = self.time.now();
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            inserted_at: now,
            last_used: now,
            expires_at: self.deadline(now),
            last_used_at: self.time.system_time(),
        };
        self.entries
            .insert(key.to_string(), entry)
            .map(|previous| previous.value)
    }

    /// Look up `key`, refreshing its deadline on a hit
    pub fn lookup(&mut self, key: &str) -> Lookup<V> {
        let now = self.time.now();
        let expired = match self.entries.get(key) {
            Some(entry) => self.is_expired(entry, now),
            None => return Lookup::Miss,
        };

        if expired {
            return match self.entries.remove(key) {
                Some(entry) => Lookup::Expired(entry.value),
                None => Lookup::Miss,
            };
        }

        let deadline = self.deadline(now);
        let system_now = self.time.system_time();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = now;
                entry.last_used_at = system_now;
                entry.expires_at = deadline;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Unexpired value for `key`, refreshing its deadline
    pub fn get(&mut self, key: &str) -> Option<V> {
        match self.lookup(key) {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }

    /// Refresh `key` if it is still live
    ///
    /// Unlike `lookup`, an expired entry is left in place for `evict_expired`.
    pub fn touch(&mut self, key: &str) -> Option<&V> {
        let now = self.time.now();
        let deadline = self.deadline(now);
        let system_now = self.time.system_time();
        let entry = self.entries.get_mut(key)?;
        if entry.expires_at.is_some_and(|expires| now >= expires) {
            return None;
        }
        entry.last_used = now;
        entry.last_used_at = system_now;
        entry.expires_at = deadline;
        Some(&entry.value)
    }

    /// Entry for `key` without refreshing it; expired entries are hidden
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        let now = self.time.now();
        self.entries
            .get(key)
            .filter(|entry| !self.is_expired(entry, now))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Remove one entry regardless of expiry
    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|entry| entry.value)
    }

    /// Remove every entry, returning the values
    pub fn clear(&mut self) -> Vec<V> {
        let mut drained: Vec<(String, V)> = self
            .entries
            .drain()
            .map(|(key, entry)| (key, entry.value))
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained.into_iter().map(|(_, value)| value).collect()
    }

    /// Remove every expired entry, returning them
    pub fn evict_expired(&mut self) -> Vec<(String, V)> {
        let now = self.time.now();
        let mut expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| self.is_expired(entry, now))
            .map(|entry| entry.key.clone())
            .collect();
        expired.sort();

        expired
            .into_iter()
            .filter_map(|key| {
                self.entries
                    .remove(&key)
                    .map(|entry| (key, entry.value))
            })
            .collect()
    }

    /// Keys of unexpired entries, sorted
    pub fn keys(&self) -> Vec<String> {
        let now = self.time.now();
        let mut keys: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of stored entries, expired ones included until evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
