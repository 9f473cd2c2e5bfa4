//! A generic mapping from keys to values with a per-entry timestamp and TTL.
//!
//! Backs the ARP resolution table, the ARP pending-send queue, and (via
//! plain `HashMap`s elsewhere) the port and connection tables. Expiry is
//! evaluated lazily on access — there is no background sweep thread,
//! matching the single-threaded, no-locks resource model: a stale entry
//! simply looks absent the next time anyone asks for it.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use crate::error::NetError;

/// A TTL-bounded map. `ttl = None` means entries never expire.
/// `max_entries = None` means unbounded.
pub struct TimedMap<K, V> {
    entries: HashMap<K, (V, Instant)>,
    ttl: Option<Duration>,
    max_entries: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> TimedMap<K, V> {
    pub fn new(ttl: Option<Duration>, max_entries: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    fn is_expired(&self, inserted_at: Instant) -> bool {
        match self.ttl {
            Some(ttl) => inserted_at.elapsed() > ttl,
            None => false,
        }
    }

    /// Upsert `key -> val`, refreshing its timestamp. Fails with
    /// [`NetError::NoBufferSpace`] if the map is at capacity and `key` is new.
    pub fn set(&mut self, key: K, val: V) -> Result<(), NetError> {
        if !self.entries.contains_key(&key) {
            if let Some(max) = self.max_entries {
                if self.entries.len() >= max {
                    return Err(NetError::NoBufferSpace);
                }
            }
        }
        self.entries.insert(key, (val, Instant::now()));
        Ok(())
    }

    /// Look up `key`, purging it first if its TTL has elapsed.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if let Some((_, inserted_at)) = self.entries.get(key) {
            if self.is_expired(*inserted_at) {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get(key).map(|(v, _)| v)
    }

    /// Mutable lookup with the same lazy-expiry behavior as [`Self::get`].
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if let Some((_, inserted_at)) = self.entries.get(key) {
            if self.is_expired(*inserted_at) {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get_mut(key).map(|(v, _)| v)
    }

    /// Remove `key` unconditionally, returning its value if present and unexpired.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let fresh = self.get(key).is_some();
        if fresh {
            self.entries.remove(key).map(|(v, _)| v)
        } else {
            None
        }
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Visit every non-expired entry, removing any for which `f` returns `true`.
    pub fn retain_remove(&mut self, mut f: impl FnMut(&K, &V) -> bool) {
        let ttl = self.ttl;
        self.entries.retain(|k, (v, inserted_at)| {
            if let Some(ttl) = ttl {
                if inserted_at.elapsed() > ttl {
                    return false;
                }
            }
            !f(k, v)
        });
    }
}
