use std::collections::VecDeque;
use std::sync::Mutex;

/// A publish waiting for the broker to come back.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Bounded FIFO store-and-forward queue. The send queue is the ordering
/// authority: flushes pop from the front, and a failed flush puts the
/// message back at the head.
pub struct PublishQueue {
    inner: Mutex<VecDeque<QueuedPublish>>,
    capacity: usize,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue at the tail; the oldest message is dropped on overflow.
    /// Returns true when a message had to be dropped.
    pub fn push_back(&self, publish: QueuedPublish) -> bool {
        let mut queue = self.inner.lock().expect("queue poisoned");
        let mut dropped = false;
        if queue.len() == self.capacity {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(publish);
        dropped
    }

    /// Put a message back at the head after a failed flush.
    pub fn push_front(&self, publish: QueuedPublish) {
        let mut queue = self.inner.lock().expect("queue poisoned");
        if queue.len() == self.capacity {
            queue.pop_back();
        }
        queue.push_front(publish);
    }

    pub fn pop_front(&self) -> Option<QueuedPublish> {
        self.inner.lock().expect("queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
