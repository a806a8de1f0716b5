// Copyright 2025 Chunkpool project contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::heapmap::MinHeapMap;

#[test]
fn peek_returns_minimum() {
    let mut heap: MinHeapMap<u64, u64> = MinHeapMap::new();
    heap.insert(1, 30);
    heap.insert(2, 10);
    heap.insert(3, 20);
    assert_eq!(heap.peek(), Some((&2, &10)));
    assert_eq!(heap.len(), 3);
}

#[test]
fn pop_drains_in_priority_order() {
    let mut heap: MinHeapMap<u64, u64> = MinHeapMap::new();
    for (key, priority) in [(1, 50), (2, 40), (3, 60), (4, 10), (5, 30)] {
        heap.insert(key, priority);
    }
    let mut drained = Vec::new();
    while let Some((key, _)) = heap.pop() {
        drained.push(key);
    }
    assert_eq!(drained, vec![4, 5, 2, 1, 3]);
}

#[test]
fn insert_reprioritizes_existing_key() {
    let mut heap: MinHeapMap<u64, u64> = MinHeapMap::new();
    heap.insert(1, 10);
    heap.insert(2, 20);
    heap.insert(1, 30);
    assert_eq!(heap.len(), 2);
    assert_eq!(heap.peek(), Some((&2, &20)));
    heap.insert(1, 5);
    assert_eq!(heap.peek(), Some((&1, &5)));
}

#[test]
fn remove_by_key() {
    let mut heap: MinHeapMap<u64, u64> = MinHeapMap::new();
    heap.insert(1, 10);
    heap.insert(2, 20);
    heap.insert(3, 30);
    assert_eq!(heap.remove(&1), Some(10));
    assert_eq!(heap.remove(&1), None);
    assert!(!heap.contains(&1));
    assert_eq!(heap.peek(), Some((&2, &20)));
}

#[test]
fn tuple_priorities_order_lexicographically() {
    // The scheduler keys agents by (avarice, serial) and readaheads by (spent, len).
    let mut heap: MinHeapMap<u64, (u64, u64)> = MinHeapMap::new();
    heap.insert(1, (1, 0));
    heap.insert(2, (0, 5));
    heap.insert(3, (0, 2));
    assert_eq!(heap.peek(), Some((&3, &(0, 2))));
}

#[test]
fn survives_interleaved_churn() {
    let mut heap: MinHeapMap<u64, u64> = MinHeapMap::new();
    for i in 0..100 {
        heap.insert(i, (i * 7919) % 101);
    }
    for i in (0..100).step_by(3) {
        heap.remove(&i);
    }
    for i in 0..100 {
        heap.insert(i, (i * 104_729) % 101);
    }
    let mut last = 0;
    let mut count = 0;
    while let Some((_, priority)) = heap.pop() {
        assert!(priority >= last);
        last = priority;
        count += 1;
    }
    assert_eq!(count, 100);
}
