use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::Notify;

/// Bounded FIFO shared between tasks. When full, the oldest unread item is
/// discarded to make room for the new one, so senders never wait.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    capacity: usize,
    queue: Mutex<VecDeque<T>>,
    signal: Notify,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                signal: Notify::new(),
            }),
        }
    }

    /// Returns the item that was evicted to make room, if any.
    pub fn send(&self, item: T) -> Option<T> {
        let (evicted, was_empty) = {
            let mut queue = self.queue();
            let was_empty = queue.is_empty();
            let evicted = if queue.len() >= self.inner.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            (evicted, was_empty)
        };

        if was_empty {
            self.inner.signal.notify_one();
        }
        evicted
    }

    pub fn try_recv(&self) -> Option<T> {
        self.queue().pop_front()
    }

    pub async fn recv(&self) -> T {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            self.inner.signal.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
