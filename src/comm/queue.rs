//! FIFO of pending transport operations with a single "current" slot.
use std::collections::VecDeque;

use crate::transport::Operation;

#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    current: Option<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation and return the number of queued (not yet started) operations.
    pub fn enqueue(&mut self, op: Operation) -> usize {
        self.pending.push_back(op);
        self.pending.len()
    }

    /// Check-and-set: hand out the head of the queue only when nothing is
    /// outstanding, and mark it as current.
    pub fn next(&mut self) -> Option<Operation> {
        if self.current.is_some() {
            return None;
        }
        let op = self.pending.pop_front()?;
        self.current = Some(op.clone());
        Some(op)
    }

    /// Clear the current slot once its completion has arrived.
    pub fn complete(&mut self) -> Option<Operation> {
        self.current.take()
    }

    /// Drop queued operations that have not started. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Drop everything, including the outstanding marker.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.current = None;
    }

    pub fn current(&self) -> Option<&Operation> {
        self.current.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(byte: u8) -> Operation {
        Operation::CharacteristicWrite {
            service: uuid::Uuid::nil(),
            characteristic: uuid::Uuid::nil(),
            payload: vec![byte],
        }
    }

    #[test]
    fn test_fifo_with_single_current() {
        let mut queue = OperationQueue::new();
        assert_eq!(queue.enqueue(write(1)), 1);
        assert_eq!(queue.enqueue(write(2)), 2);

        assert_eq!(queue.next(), Some(write(1)));
        assert!(queue.is_busy());
        assert_eq!(queue.next(), None);

        assert_eq!(queue.complete(), Some(write(1)));
        assert_eq!(queue.next(), Some(write(2)));
        queue.complete();
        assert_eq!(queue.next(), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_clear_keeps_outstanding_marker() {
        let mut queue = OperationQueue::new();
        queue.enqueue(write(1));
        queue.enqueue(write(2));
        queue.enqueue(write(3));
        queue.next();
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_busy());
        queue.reset();
        assert!(queue.is_idle());
        assert_eq!(queue.current(), None);
    }
}
