//! Bounded, oldest-evicted history store shared by every component.

use parking_lot::RwLock;
use std::collections::VecDeque;

/// FIFO store holding at most `capacity` entries; inserting past capacity
/// evicts the oldest entry.
#[derive(Debug)]
pub struct BoundedHistory<T> {
    capacity: usize,
    entries: RwLock<VecDeque<T>>,
}

impl<T: Clone> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert an entry, returning the evicted one if the store was full
    pub fn push(&self, entry: T) -> Option<T> {
        let mut entries = self.entries.write();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entries oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.read().iter().cloned().collect()
    }

    /// Entries newest first
    pub fn newest_first(&self) -> Vec<T> {
        self.entries.read().iter().rev().cloned().collect()
    }

    pub fn find<P>(&self, predicate: P) -> Option<T>
    where
        P: Fn(&T) -> bool,
    {
        self.entries.read().iter().rev().find(|e| predicate(e)).cloned()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
