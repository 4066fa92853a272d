use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Bounded, mutex+condvar guarded deque. Producers block on `push_back` when
/// full; consumers block on `pop` when empty. `close` wakes everyone and
/// makes every subsequent `pop` return `None`.
pub struct BlockDeque<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

struct Inner<T> {
    deq: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> BlockDeque<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        BlockDeque {
            inner: Mutex::new(Inner {
                deq: VecDeque::new(),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn push_back(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.len() >= inner.capacity && !inner.closed {
            inner = self.not_full.wait(inner).unwrap();
        }
        if inner.closed {
            return;
        }
        inner.deq.push_back(item);
        self.not_empty.notify_one();
    }

    /// Returns `None` once the queue has been closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        while inner.deq.is_empty() {
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
        let item = inner.deq.pop_front();
        self.not_full.notify_one();
        item
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().deq.is_empty()
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.deq.len() >= inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deq.len()
    }

    /// Wake one waiting consumer without pushing anything.
    pub fn flush(&self) {
        self.not_empty.notify_one();
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.deq.clear();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}
