//! Fixed-size thread pool draining a shared FIFO of nullary tasks under a
//! mutex + condvar. Workers unlock while running a task so the queue never
//! serializes task execution, only queue access.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    mtx: Mutex<State>,
    cond: Condvar,
}

struct State {
    tasks: VecDeque<Task>,
    closed: bool,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Spawns `thread_count` detached workers sharing one task queue.
    pub fn new(thread_count: usize) -> Self {
        assert!(thread_count > 0);
        let shared = Arc::new(Shared {
            mtx: Mutex::new(State {
                tasks: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });
        for _ in 0..thread_count {
            let shared = shared.clone();
            thread::spawn(move || worker_loop(shared));
        }
        WorkerPool { shared }
    }

    /// Enqueue a task. Calling this after the pool has been dropped is a
    /// caller error in the original design; here it is simply a no-op since
    /// `submit` only ever sees the pool while it is alive.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.mtx.lock().unwrap();
        if state.closed {
            return;
        }
        state.tasks.push_back(Box::new(task));
        drop(state);
        self.shared.cond.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.mtx.lock().unwrap();
            state.closed = true;
        }
        self.shared.cond.notify_all();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut state = shared.mtx.lock().unwrap();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                drop(state);
                task();
                break;
            } else if state.closed {
                return;
            } else {
                state = shared.cond.wait(state).unwrap();
            }
        }
    }
}
