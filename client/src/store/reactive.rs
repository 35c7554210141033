use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use tokio::sync::broadcast;

/// Deltas buffered per subscriber before it starts lagging.
const CHANGE_BUFFER: usize = 16;

/// A change published by a [`ReactiveSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetChange<T> {
    Added(T),
    Removed(T),
    /// The whole contents were swapped by a hydration patch.
    Replaced,
}

/// A change published by a [`ReactiveMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapChange<K> {
    Set(K),
    Removed(K),
    Replaced,
}

/// A set owned by an entity record that publishes every mutation.
///
/// Readers holding a receiver from [`ReactiveSet::subscribe`] see the deltas
/// without re-reading the record. Cloning produces a detached snapshot: the
/// copy has its own channel and nobody is subscribed to it.
pub struct ReactiveSet<T: Clone> {
    items: HashSet<T>,
    changes: broadcast::Sender<SetChange<T>>,
}

impl<T: Clone + Eq + Hash> ReactiveSet<T> {
    pub fn new() -> Self {
        Self::with_items(HashSet::new())
    }

    fn with_items(items: HashSet<T>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { items, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SetChange<T>> {
        self.changes.subscribe()
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Insert a value. Returns false (and publishes nothing) if it was present.
    pub fn insert(&mut self, value: T) -> bool {
        if !self.items.insert(value.clone()) {
            return false;
        }
        // No subscribers is not an error.
        let _ = self.changes.send(SetChange::Added(value));
        true
    }

    /// Remove a value. Returns false (and publishes nothing) if it was absent.
    pub fn remove(&mut self, value: &T) -> bool {
        if !self.items.remove(value) {
            return false;
        }
        let _ = self.changes.send(SetChange::Removed(value.clone()));
        true
    }

    /// Swap the whole contents, keeping existing subscribers attached.
    pub fn replace(&mut self, values: impl IntoIterator<Item = T>) {
        self.items = values.into_iter().collect();
        let _ = self.changes.send(SetChange::Replaced);
    }

    pub fn clear(&mut self) {
        if self.items.is_empty() {
            return;
        }
        self.items.clear();
        let _ = self.changes.send(SetChange::Replaced);
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T: Clone + Eq + Hash> Default for ReactiveSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Eq + Hash> Clone for ReactiveSet<T> {
    fn clone(&self) -> Self {
        Self::with_items(self.items.clone())
    }
}

impl<T: Clone + Eq + Hash> FromIterator<T> for ReactiveSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::with_items(iter.into_iter().collect())
    }
}

impl<T: Clone + Eq + Hash> PartialEq for ReactiveSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for ReactiveSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.items.iter()).finish()
    }
}

/// A keyed map owned by an entity record that publishes every mutation.
pub struct ReactiveMap<K: Clone, V> {
    entries: HashMap<K, V>,
    changes: broadcast::Sender<MapChange<K>>,
}

impl<K: Clone + Eq + Hash, V> ReactiveMap<K, V> {
    pub fn new() -> Self {
        Self::with_entries(HashMap::new())
    }

    fn with_entries(entries: HashMap<K, V>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { entries, changes }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MapChange<K>> {
        self.changes.subscribe()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_key_value(&self, key: &K) -> Option<(&K, &V)> {
        self.entries.get_key_value(key)
    }

    /// Mutable access to a value. Mutations through this reference are not
    /// published at map level; reactive values publish their own changes.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Insert or overwrite a value, returning the previous one.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key.clone(), value);
        let _ = self.changes.send(MapChange::Set(key));
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key)?;
        let _ = self.changes.send(MapChange::Removed(key.clone()));
        Some(removed)
    }

    /// Swap the whole contents, keeping existing subscribers attached.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = (K, V)>) {
        self.entries = entries.into_iter().collect();
        let _ = self.changes.send(MapChange::Replaced);
    }
}

impl<K: Clone + Eq + Hash, V> Default for ReactiveMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash, V: Clone> Clone for ReactiveMap<K, V> {
    fn clone(&self) -> Self {
        Self::with_entries(self.entries.clone())
    }
}

impl<K: Clone + Eq + Hash, V> FromIterator<(K, V)> for ReactiveMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::with_entries(iter.into_iter().collect())
    }
}

impl<K: Clone + fmt::Debug, V: fmt::Debug> fmt::Debug for ReactiveMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
