//! Encode order queue
//!
//! FIFO of slots that were handed to the backend (successfully or not) and
//! are not yet retired. Backends complete work in submission order and do
//! not tag their output, so the head of this queue is always the slot the
//! next completed result belongs to.

use std::collections::VecDeque;

use super::SlotId;

/// Submission-ordered queue of outstanding slots
///
/// Entries are 1:1 with in-flight slots, so the length is bounded by the
/// pool capacity. Exceeding it means a slot was queued twice.
#[derive(Debug)]
pub struct EncodeOrderQueue {
    entries: VecDeque<SlotId>,
    capacity: usize,
}

impl EncodeOrderQueue {
    /// Create a queue bounded by the pool capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a submitted slot
    ///
    /// # Panics
    ///
    /// Panics if the queue already holds `capacity` entries or if the slot is
    /// already queued.
    pub fn push(&mut self, id: SlotId) {
        assert!(
            self.entries.len() < self.capacity,
            "encode order queue overflow: {} entries for {} slots",
            self.entries.len() + 1,
            self.capacity
        );
        assert!(!self.entries.contains(&id), "{} queued twice", id);
        self.entries.push_back(id);
    }

    /// Oldest outstanding slot
    pub fn front(&self) -> Option<SlotId> {
        self.entries.front().copied()
    }

    /// Retire the oldest outstanding slot
    pub fn pop_front(&mut self) -> Option<SlotId> {
        self.entries.pop_front()
    }

    /// Number of outstanding submissions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No outstanding submissions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding slots, oldest first
    pub fn iter(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.entries.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::FrameSlotPool;

    fn ids(n: usize) -> Vec<SlotId> {
        let pool = FrameSlotPool::new(n);
        (0..n).map(|i| pool.id(i).unwrap()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let ids = ids(3);
        let mut queue = EncodeOrderQueue::new(3);
        queue.push(ids[2]);
        queue.push(ids[0]);
        queue.push(ids[1]);

        assert_eq!(queue.front(), Some(ids[2]));
        assert_eq!(queue.pop_front(), Some(ids[2]));
        assert_eq!(queue.pop_front(), Some(ids[0]));
        assert_eq!(queue.pop_front(), Some(ids[1]));
        assert!(queue.is_empty());
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_overflow_is_asserted() {
        let ids = ids(2);
        let mut queue = EncodeOrderQueue::new(1);
        queue.push(ids[0]);
        queue.push(ids[1]);
    }

    #[test]
    #[should_panic(expected = "queued twice")]
    fn test_duplicate_is_asserted() {
        let ids = ids(2);
        let mut queue = EncodeOrderQueue::new(2);
        queue.push(ids[0]);
        queue.push(ids[0]);
    }
}
