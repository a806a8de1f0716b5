// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::hash::Hash;

///
/// A binary min-heap combined with a key index: peek-min in O(1), insert, reprioritize
/// and remove-by-key in O(log n). The scheduler uses this for the ready-agents heap, an
/// agent's readahead heap, and its pending-write serials.
///
pub struct MinHeapMap<K, P> {
    heap: Vec<Node<K, P>>,
    positions: HashMap<K, usize>,
}

struct Node<K, P> {
    key: K,
    priority: P,
}

impl<K: Copy + Eq + Hash, P: Copy + Ord> MinHeapMap<K, P> {
    pub fn new() -> MinHeapMap<K, P> {
        MinHeapMap {
            heap: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.positions.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&P> {
        self.positions.get(key).map(|&index| &self.heap[index].priority)
    }

    /// The entry with the smallest priority.
    pub fn peek(&self) -> Option<(&K, &P)> {
        self.heap.first().map(|node| (&node.key, &node.priority))
    }

    /// Inserts the key, or reprioritizes it if already present.
    pub fn insert(&mut self, key: K, priority: P) {
        if let Some(&index) = self.positions.get(&key) {
            let old = self.heap[index].priority;
            self.heap[index].priority = priority;
            if priority < old {
                self.sift_up(index);
            } else if priority > old {
                self.sift_down(index);
            }
        } else {
            let index = self.heap.len();
            self.heap.push(Node { key, priority });
            self.positions.insert(key, index);
            self.sift_up(index);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<P> {
        let index = self.positions.remove(key)?;
        let removed = self.heap.swap_remove(index);
        if index < self.heap.len() {
            self.positions.insert(self.heap[index].key, index);
            // The swapped-in node may violate the heap property in either direction.
            self.sift_up(index);
            self.sift_down(index);
        }
        Some(removed.priority)
    }

    pub fn pop(&mut self) -> Option<(K, P)> {
        let key = *self.peek()?.0;
        let priority = self.remove(&key)?;
        Some((key, priority))
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.heap[index].priority >= self.heap[parent].priority {
                break;
            }
            self.swap(index, parent);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let mut smallest = index;
            for child in [index * 2 + 1, index * 2 + 2] {
                if child < self.heap.len()
                    && self.heap[child].priority < self.heap[smallest].priority
                {
                    smallest = child;
                }
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].key, a);
        self.positions.insert(self.heap[b].key, b);
    }
}
