//! Reference-counted registries shared by everything on one transport.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque token representing one consumer's interest in a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherToken(u64);

impl WatcherToken {
    /// Returns the raw token number.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatcherToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watcher#{}", self.0)
    }
}

struct Entry<V> {
    value: V,
    watchers: HashSet<WatcherToken>,
}

/// A keyed table of shared values with explicit watcher sets.
///
/// An entry exists if and only if its watcher set is non-empty. The value is
/// created by the first [`acquire`](Self::acquire) and handed back by the
/// [`release`](Self::release) that empties the set, so the caller can tear
/// it down.
pub struct SharedRegistry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    next_token: AtomicU64,
}

impl<K, V> SharedRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers a watcher for `key`, creating the value if absent.
    ///
    /// Returns the shared value and a fresh token for this watcher.
    pub fn acquire(&self, key: K, create: impl FnOnce() -> V) -> (V, WatcherToken) {
        let token = WatcherToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| Entry {
            value: create(),
            watchers: HashSet::new(),
        });
        entry.watchers.insert(token);
        (entry.value.clone(), token)
    }

    /// Removes a watcher from `key`.
    ///
    /// Returns the value if this removed the last watcher; the entry is gone
    /// afterwards. Unknown keys and tokens are ignored.
    pub fn release(&self, key: &K, token: WatcherToken) -> Option<V> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if !entry.watchers.remove(&token) || !entry.watchers.is_empty() {
            return None;
        }
        entries.remove(key).map(|entry| entry.value)
    }

    /// Returns the value for `key`, if any watcher holds it.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().get(key).map(|entry| entry.value.clone())
    }

    /// Returns the number of watchers of `key`.
    pub fn watcher_count(&self, key: &K) -> usize {
        self.entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.watchers.len())
    }

    /// Returns the number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no entry is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> Default for SharedRegistry<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
