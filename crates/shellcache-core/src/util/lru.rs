//! Fixed-capacity least-recently-used map.
//!
//! Entries live in a slot arena and are threaded onto a doubly linked
//! recency list by index, so no entry is ever boxed or moved on access.

use std::collections::HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Slot<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    /// Least recently used
    head: usize,
    /// Most recently used
    tail: usize,
}

impl<K: Hash + Eq + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Look up a value and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.index.get(key)?;
        self.detach(idx);
        self.push_back(idx);
        self.slots[idx].as_ref().map(|s| &s.value)
    }

    /// Insert or replace a value. Returns the evicted entry, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.index.get(&key) {
            self.detach(idx);
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.value = value;
            }
            self.push_back(idx);
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.pop_front()
        } else {
            None
        };

        let slot = Slot {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_back(idx);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.index.remove(key)?;
        self.detach(idx);
        self.free.push(idx);
        self.slots[idx].take().map(|s| s.value)
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while cursor != NIL {
            match self.slots[cursor].as_ref() {
                Some(slot) => {
                    keys.push(slot.key.clone());
                    cursor = slot.next;
                }
                None => break,
            }
        }
        keys
    }

    fn pop_front(&mut self) -> Option<(K, V)> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        self.detach(idx);
        self.free.push(idx);
        let slot = self.slots[idx].take()?;
        self.index.remove(&slot.key);
        Some((slot.key, slot.value))
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = NIL;
            slot.next = NIL;
        }
    }

    fn push_back(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(slot) = self.slots[idx].as_mut() {
            slot.prev = old_tail;
            slot.next = NIL;
        }
        if old_tail != NIL {
            if let Some(t) = self.slots[old_tail].as_mut() {
                t.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }
}
