use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Capacity-bounded LRU map.
///
/// `get` refreshes recency; `insert` reports whether a victim was dropped so
/// callers can attribute the eviction. The order queue is scanned linearly
/// on refresh, which is fine for the key counts the parser caches see.
#[derive(Debug)]
pub struct Lru<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> Lru<K, V> {
    pub fn new(capacity: usize) -> Lru<K, V> {
        assert!(capacity > 0, "LRU capacity must be positive");
        Lru {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.map.contains_key(key) {
            return None;
        }
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.clone());
        self.map.get(key)
    }

    /// Insert `key`, returning `true` when the least-recently-used entry
    /// was evicted to make room.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.map.insert(key.clone(), value).is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == &key) {
                self.order.remove(pos);
            }
        }
        self.order.push_back(key);

        if self.map.len() <= self.capacity {
            return false;
        }
        if let Some(victim) = self.order.pop_front() {
            self.map.remove(&victim);
        }
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}
