//! Bounded queue of signed batches waiting to be sent to one remote site.
//!
//! When the queue is full the oldest unsent batch is shed so the newest
//! changes keep flowing; the caller reports every shed batch.

use std::collections::VecDeque;

use crate::conduit::BatchEnvelope;

/// Unsent batches for one remote site, oldest first.
#[derive(Debug)]
pub struct Outbox {
    capacity: usize,
    queue: VecDeque<BatchEnvelope>,
    shed_total: u64,
}

impl Outbox {
    /// Creates an outbox holding at most `capacity` batches.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            shed_total: 0,
        }
    }

    /// Queues a batch; returns the batch that was shed to make room, if any.
    pub fn push(&mut self, batch: BatchEnvelope) -> Option<BatchEnvelope> {
        let shed = if self.queue.len() >= self.capacity {
            self.shed_total += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(batch);
        shed
    }

    /// The oldest unsent batch.
    pub fn front(&self) -> Option<&BatchEnvelope> {
        self.queue.front()
    }

    /// Removes the oldest batch once it has been delivered.
    pub fn pop(&mut self) -> Option<BatchEnvelope> {
        self.queue.pop_front()
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns true if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Returns true if the next push sheds a batch.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Batches shed since creation.
    pub fn shed_total(&self) -> u64 {
        self.shed_total
    }
}
