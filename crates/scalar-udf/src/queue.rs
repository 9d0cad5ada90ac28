use crate::{RowKind, Value};
use std::collections::VecDeque;

/// PendingEntry is a record whose function call was submitted, but whose
/// result hasn't yet been joined. It retains only the record's change flag
/// and the fields which are forwarded into its joined row.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub kind: RowKind,
    pub forwarded: Vec<Value>,
}

/// ForwardingQueue is a bounded FIFO of items awaiting results.
/// It's owned by a single thread, and is never shared.
#[derive(Debug)]
pub struct ForwardingQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> ForwardingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Push `item` to the tail of the queue.
    /// A full queue hands `item` back: callers must make room first.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.entries.push_back(item);
        Ok(())
    }

    pub fn peek_front(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    /// Remove and return all queued items, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..)
    }
}
