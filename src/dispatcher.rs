//! Per-owner FIFO execution on a shared executor.
//!
//! An [`OrderedDispatcher`] runs the tasks submitted to it one at a time, in
//! submission order, without owning a thread. The first submission while idle
//! hands a drain loop to the executor; later submissions are picked up by that
//! loop. The queue and the "draining" flag share one lock, so a task queued
//! while the loop is deciding to stop is never stranded.
use crate::diagnostics::{panic_message, Diagnostics};
use crate::executor::{Executor, Task};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Clone)]
pub struct OrderedDispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    executor: Arc<dyn Executor>,
    diagnostics: Arc<dyn Diagnostics>,
    queue: Mutex<Queue>,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    draining: bool,
}

impl OrderedDispatcher {
    pub fn new(executor: Arc<dyn Executor>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        OrderedDispatcher {
            inner: Arc::new(Inner {
                executor,
                diagnostics,
                queue: Mutex::new(Queue::default()),
            }),
        }
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let start_drain = {
            let mut queue = self.inner.queue.lock();
            queue.tasks.push_back(Box::new(task));
            !std::mem::replace(&mut queue.draining, true)
        };

        if start_drain {
            let inner = self.inner.clone();
            self.inner.executor.submit(Box::new(move || inner.drain()));
        }
    }

    /// Number of tasks waiting to run, not counting one currently running.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().tasks.len()
    }
}

impl Inner {
    fn drain(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                self.diagnostics
                    .task_panicked(&panic_message(payload.as_ref()));
            }
        }
    }
}
