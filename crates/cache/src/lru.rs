//! Access-ordered entry list
//!
//! Doubly linked list of cache entries stored in an arena, plus a hash index
//! from key to node. Promote-to-front, unlink and tail removal are O(1).
//! The head is the most recently used entry, the tail the least recently used.

use generational_arena::{Arena, Index};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

struct Node<K, V> {
    key: K,
    value: Arc<V>,
    bytes: u64,
    prev: Option<Index>,
    next: Option<Index>,
}

/// Recency-ordered map from key to shared value.
pub(crate) struct LruList<K, V> {
    nodes: Arena<Node<K, V>>,
    lookup: HashMap<K, Index>,
    head: Option<Index>,
    tail: Option<Index>,
}

impl<K: Eq + Hash + Clone, V> LruList<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Arena::new(),
            lookup: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lookup.len()
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.lookup.contains_key(key)
    }

    /// Returns the value for `key` without changing its position.
    pub(crate) fn peek(&self, key: &K) -> Option<Arc<V>> {
        let index = *self.lookup.get(key)?;
        Some(self.nodes[index].value.clone())
    }

    /// Returns the value for `key` and moves it to the head.
    pub(crate) fn get_and_promote(&mut self, key: &K) -> Option<Arc<V>> {
        let index = *self.lookup.get(key)?;
        if self.head != Some(index) {
            self.unlink(index);
            self.link_front(index);
        }
        Some(self.nodes[index].value.clone())
    }

    /// Inserts a new entry at the head. The key must not be present.
    pub(crate) fn push_front(&mut self, key: K, value: Arc<V>, bytes: u64) {
        debug_assert!(!self.lookup.contains_key(&key));
        let index = self.nodes.insert(Node {
            key: key.clone(),
            value,
            bytes,
            prev: None,
            next: None,
        });
        self.lookup.insert(key, index);
        self.link_front(index);
    }

    /// Removes the entry for `key`, returning its value and recorded size.
    pub(crate) fn remove(&mut self, key: &K) -> Option<(Arc<V>, u64)> {
        let index = self.lookup.remove(key)?;
        self.unlink(index);
        let node = self.nodes.remove(index)?;
        Some((node.value, node.bytes))
    }

    /// Removes the least recently used entry.
    pub(crate) fn pop_back(&mut self) -> Option<(K, Arc<V>, u64)> {
        let index = self.tail?;
        self.unlink(index);
        let node = self.nodes.remove(index)?;
        self.lookup.remove(&node.key);
        Some((node.key, node.value, node.bytes))
    }

    /// Removes every entry, returning them from least to most recently used.
    pub(crate) fn drain(&mut self) -> Vec<(K, Arc<V>, u64)> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop_back() {
            drained.push(entry);
        }
        drained
    }

    /// Keys ordered from least to most recently used.
    pub(crate) fn keys_oldest_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut current = self.tail;
        while let Some(index) = current {
            keys.push(self.nodes[index].key.clone());
            current = self.nodes[index].prev;
        }
        keys
    }

    fn unlink(&mut self, index: Index) {
        let (prev, next) = {
            let node = &self.nodes[index];
            (node.prev, node.next)
        };

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        let node = &mut self.nodes[index];
        node.prev = None;
        node.next = None;
    }

    fn link_front(&mut self, index: Index) {
        let old_head = self.head;
        {
            let node = &mut self.nodes[index];
            node.prev = None;
            node.next = old_head;
        }
        if let Some(old_head) = old_head {
            self.nodes[old_head].prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}
