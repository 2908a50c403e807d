//! Fixed-capacity ring buffer.
//!
//! Used for per-device error history, raw frame buffers and processed
//! reading history. Pushing into a full buffer evicts the oldest element.

use std::collections::VecDeque;
use std::collections::vec_deque::{Iter, IterMut};

/// A bounded FIFO that drops its oldest element on overflow.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create an empty buffer holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an element, returning the evicted oldest element if the buffer
    /// was full.
    ///
    /// A zero-capacity buffer stores nothing and hands the element back.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of stored elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove all elements.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// The newest element.
    pub fn newest(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> Iter<'_, T> {
        self.items.iter()
    }

    /// Iterate oldest to newest with mutable access.
    pub fn iter_mut(&mut self) -> IterMut<'_, T> {
        self.items.iter_mut()
    }

    /// The newest `n` elements, oldest first.
    pub fn last(&self, n: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(n))
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy the contents into a `Vec`, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a RingBuffer<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_below_capacity() {
        let mut buffer = RingBuffer::new(3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.push(1), None);
        assert_eq!(buffer.push(2), None);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.to_vec(), vec![1, 2]);
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut buffer = RingBuffer::new(3);
        for i in 0..3 {
            buffer.push(i);
        }
        assert_eq!(buffer.push(3), Some(0));
        assert_eq!(buffer.push(4), Some(1));
        assert_eq!(buffer.to_vec(), vec![2, 3, 4]);
        assert_eq!(buffer.newest(), Some(&4));
    }

    #[test]
    fn test_zero_capacity_stores_nothing() {
        let mut buffer = RingBuffer::new(0);
        assert_eq!(buffer.push("a"), Some("a"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_last() {
        let mut buffer = RingBuffer::new(5);
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.last(2).copied().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(buffer.last(0).count(), 0);
        assert_eq!(buffer.last(100).count(), 5);
    }

    #[test]
    fn test_iter_mut_updates_in_place() {
        let mut buffer = RingBuffer::new(4);
        for i in 0..4 {
            buffer.push((i, false));
        }
        for item in buffer.iter_mut().take(2) {
            item.1 = true;
        }
        let flags: Vec<bool> = buffer.iter().map(|(_, f)| *f).collect();
        assert_eq!(flags, vec![true, true, false, false]);
    }

    #[test]
    fn test_clear() {
        let mut buffer = RingBuffer::new(2);
        buffer.push(1);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 2);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 0usize..64, pushes in 0usize..256) {
            let mut buffer = RingBuffer::new(capacity);
            for i in 0..pushes {
                buffer.push(i);
                prop_assert!(buffer.len() <= capacity);
            }
            prop_assert_eq!(buffer.len(), pushes.min(capacity));
        }

        #[test]
        fn prop_keeps_newest_in_order(capacity in 1usize..32, pushes in 0usize..128) {
            let mut buffer = RingBuffer::new(capacity);
            for i in 0..pushes {
                buffer.push(i);
            }
            let expected: Vec<usize> = (pushes.saturating_sub(capacity)..pushes).collect();
            prop_assert_eq!(buffer.to_vec(), expected);
        }
    }
}
