//! Binary min-heap of per-connection idle timers, keyed on expiry time,
//! with an id→index side map so `adjust`/`cancel` are O(log n) instead of
//! the O(n) scan a plain sorted list would need.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type TimerId = usize;
pub type Callback = Box<dyn FnOnce() + Send>;

struct TimerNode {
    id: TimerId,
    expires: Instant,
    cb: Callback,
}

pub struct HeapTimer {
    heap: Vec<TimerNode>,
    ref_: HashMap<TimerId, usize>,
}

impl HeapTimer {
    pub fn new() -> Self {
        HeapTimer {
            heap: Vec::new(),
            ref_: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.ref_.contains_key(&id)
    }

    /// Insert a new timer for `id`, or reset an existing one's expiry and
    /// callback and re-heapify from its current position.
    pub fn add(&mut self, id: TimerId, timeout: Duration, cb: Callback) {
        match self.ref_.get(&id).copied() {
            None => {
                let i = self.heap.len();
                self.ref_.insert(id, i);
                self.heap.push(TimerNode {
                    id,
                    expires: Instant::now() + timeout,
                    cb,
                });
                self.sift_up(i);
            }
            Some(i) => {
                self.heap[i].expires = Instant::now() + timeout;
                self.heap[i].cb = cb;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
        }
    }

    /// Update an existing timer's expiry without touching its callback.
    pub fn adjust(&mut self, id: TimerId, timeout: Duration) {
        let Some(&i) = self.ref_.get(&id) else {
            return;
        };
        self.heap[i].expires = Instant::now() + timeout;
        self.sift_down(i, self.heap.len());
    }

    /// Run `id`'s callback immediately and remove it from the heap.
    pub fn do_work(&mut self, id: TimerId) {
        let Some(&i) = self.ref_.get(&id) else {
            return;
        };
        let node = self.del(i);
        (node.cb)();
    }

    /// Cancel `id` without running its callback.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(&i) = self.ref_.get(&id) {
            self.del(i);
        }
    }

    fn del(&mut self, index: usize) -> TimerNode {
        let last = self.heap.len() - 1;
        if index < last {
            self.swap(index, last);
            if !self.sift_down(index, last) {
                self.sift_up(index);
            }
        }
        let node = self.heap.pop().expect("heap non-empty");
        self.ref_.remove(&node.id);
        node
    }

    /// Run the callbacks of every timer that has already expired.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.heap.first() {
            if front.expires > now {
                break;
            }
            let node = self.del(0);
            (node.cb)();
        }
    }

    /// Runs `tick()` first, then returns the milliseconds until the next
    /// timer fires, or `None` if no timer remains (sentinel for "wait
    /// forever").
    pub fn next_tick_ms(&mut self) -> Option<u64> {
        self.tick();
        self.heap.first().map(|node| {
            let now = Instant::now();
            if node.expires <= now {
                0
            } else {
                (node.expires - now).as_millis() as u64
            }
        })
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.ref_.insert(self.heap[i].id, i);
        self.ref_.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns whether the node actually moved further from `index`.
    fn sift_down(&mut self, index: usize, n: usize) -> bool {
        let mut i = index;
        loop {
            let mut j = i * 2 + 1;
            if j >= n {
                break;
            }
            if j + 1 < n && self.heap[j + 1].expires < self.heap[j].expires {
                j += 1;
            }
            if self.heap[i].expires <= self.heap[j].expires {
                break;
            }
            self.swap(i, j);
            i = j;
        }
        i > index
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            assert!(self.heap[parent].expires <= self.heap[i].expires);
        }
        for (&id, &i) in &self.ref_ {
            assert_eq!(self.heap[i].id, id);
        }
    }
}

impl Default for HeapTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn noop() -> Callback {
        Box::new(|| {})
    }

    #[test]
    fn add_and_adjust_preserve_heap_invariants() {
        let mut t = HeapTimer::new();
        for (id, ms) in [(1, 50), (2, 40), (3, 30), (4, 20), (5, 10)] {
            t.add(id, Duration::from_millis(ms), noop());
            t.check_invariants();
        }
        t.adjust(5, Duration::from_millis(100));
        t.check_invariants();
        // after adjusting id 5 out, the soonest expiry belongs to id 4 (20ms)
        assert_eq!(t.heap[0].id, 4);
    }

    #[test]
    fn do_work_runs_callback_and_removes_node() {
        let mut t = HeapTimer::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        t.add(
            1,
            Duration::from_millis(0),
            Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(t.contains(1));
        t.do_work(1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!t.contains(1));
    }

    #[test]
    fn tick_fires_only_expired_entries() {
        let mut t = HeapTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        t.add(1, Duration::from_millis(0), {
            let fired = fired.clone();
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        });
        t.add(2, Duration::from_secs(60), noop());
        std::thread::sleep(Duration::from_millis(5));
        t.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(t.len(), 1);
        assert!(t.contains(2));
    }

    #[test]
    fn next_tick_ms_reports_sentinel_when_empty() {
        let mut t = HeapTimer::new();
        assert_eq!(t.next_tick_ms(), None);
        t.add(1, Duration::from_secs(5), noop());
        assert!(t.next_tick_ms().unwrap() > 0);
    }
}
