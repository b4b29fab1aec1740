//! Bounded in-memory URL → local path lookup.
//!
//! Insertion-ordered with oldest-first eviction. Purely a fast path in front
//! of the persisted metadata; dropping an entry here is never a correctness
//! problem.

use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub(crate) struct MemoryLookup {
    map: HashMap<String, String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl MemoryLookup {
    pub(crate) fn new(capacity: usize) -> Self {
        MemoryLookup {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn get(&self, url: &str) -> Option<&str> {
        self.map.get(url).map(String::as_str)
    }

    pub(crate) fn insert(&mut self, url: &str, path: String) {
        if self.map.insert(url.to_string(), path).is_some() {
            // Refreshed value, keep the existing slot in the order queue.
            return;
        }
        self.order.push_back(url.to_string());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    pub(crate) fn remove(&mut self, url: &str) {
        if self.map.remove(url).is_some() {
            self.order.retain(|u| u != url);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}
