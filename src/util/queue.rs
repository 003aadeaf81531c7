use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Bounded blocking multi-producer multi-consumer FIFO.
///
/// `block_new_values` switches the queue into a terminal draining state:
/// every pusher fails immediately, including pushers already asleep waiting
/// for room, while poppers keep receiving the remaining items until the
/// queue is empty.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    blocked: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                blocked: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until there is room, then enqueue. Returns `false` iff the
    /// queue has been permanently blocked.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.blocked {
                return false;
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            inner = self.not_full.wait(inner).unwrap();
        }
    }

    /// Block until an item is available and return it. `deadline` bounds the
    /// wait, `None` waits forever. Returns `None` once the deadline elapses,
    /// or once the queue is blocked and fully drained.
    pub fn pop(&self, deadline: Option<Instant>) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.blocked {
                return None;
            }
            match deadline {
                None => inner = self.not_empty.wait(inner).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    inner = self.not_empty.wait_timeout(inner, deadline - now).unwrap().0;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued items without delivering them.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.items.clear();
        self.not_full.notify_all();
    }

    /// Permanently refuse new items. Poppers drain what is already queued
    /// and then receive `None`.
    pub fn block_new_values(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}
