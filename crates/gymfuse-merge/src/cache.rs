use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded map that evicts the oldest *inserted* key when full. Reads do not
/// refresh an entry's position, so this is FIFO rather than LRU.
#[derive(Debug, Clone)]
pub struct FifoCache<K, V> {
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V> FifoCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Replacing an existing key keeps its original insertion slot. Returns
    /// the evicted entry, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return None;
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
        if self.entries.len() <= self.capacity {
            return None;
        }
        let oldest = self.order.pop_front()?;
        let value = self.entries.remove(&oldest)?;
        Some((oldest, value))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
