//! Delayed and periodic work.
//!
//! A [`TimerService`] never runs a task itself: when a deadline passes the task
//! is handed to the executor, so a slow task cannot delay other timers.
use crate::executor::{Executor, Task};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type Periodic = Arc<dyn Fn() + Send + Sync + 'static>;

pub trait TimerService: Send + Sync {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle;

    fn every(&self, initial_delay: Duration, period: Duration, task: Periodic) -> TimerHandle;
}

/// Cancels a scheduled task. Dropping the handle does not cancel.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

enum Job {
    Once(Task),
    Every { task: Periodic, period: Duration },
}

struct Entry {
    /// `None` when the deadline is past what `Instant` can represent.
    at: Option<Instant>,
    seq: u64,
    job: Job,
    handle: TimerHandle,
}

impl Entry {
    fn key(&self) -> (bool, Option<Instant>, u64) {
        (self.at.is_none(), self.at, self.seq)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct Queue {
    // BinaryHeap is a max heap, we need a min heap.
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    executor: Arc<dyn Executor>,
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// Timer backed by a single thread, started on first use.
pub struct ThreadTimer {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimer {
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        ThreadTimer {
            name: name.into(),
            shared: Arc::new(Shared {
                executor,
                queue: Mutex::new(Queue::default()),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    fn schedule(&self, at: Option<Instant>, job: Job) -> TimerHandle {
        self.ensure_started();
        let handle = TimerHandle::default();
        let mut queue = self.shared.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Reverse(Entry {
            at,
            seq,
            job,
            handle: handle.clone(),
        }));
        self.shared.wakeup.notify_one();
        handle
    }

    fn ensure_started(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || shared.run())
        {
            Ok(handle) => *thread = Some(handle),
            Err(error) => tracing::error!(timer = %self.name, %error, "failed to spawn timer thread"),
        }
    }
}

impl Shared {
    fn run(&self) {
        let mut queue = self.queue.lock();
        loop {
            if queue.shutdown {
                return;
            }
            let now = Instant::now();
            let head = queue
                .entries
                .peek()
                .map(|entry| (entry.0.at, entry.0.handle.is_cancelled()));
            match head {
                None | Some((None, false)) => {
                    self.wakeup.wait(&mut queue);
                }
                Some((Some(at), false)) if at > now => {
                    self.wakeup.wait_until(&mut queue, at);
                }
                Some(_) => {
                    let Some(Reverse(entry)) = queue.entries.pop() else {
                        continue;
                    };
                    let due = if entry.handle.is_cancelled() {
                        Err(entry)
                    } else {
                        Ok(Self::fire(&mut queue, entry))
                    };
                    // Tasks and dropped entries may re-enter the timer.
                    MutexGuard::unlocked(&mut queue, || match due {
                        Ok(task) => self.executor.submit(task),
                        Err(cancelled) => drop(cancelled),
                    });
                }
            }
        }
    }

    fn fire(queue: &mut Queue, entry: Entry) -> Task {
        match entry.job {
            Job::Once(task) => task,
            Job::Every { task, period } => {
                let periodic = task.clone();
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.entries.push(Reverse(Entry {
                    at: entry.at.and_then(|at| at.checked_add(period)),
                    seq,
                    job: Job::Every { task, period },
                    handle: entry.handle,
                }));
                Box::new(move || periodic())
            }
        }
    }
}

impl TimerService for ThreadTimer {
    fn after(&self, delay: Duration, task: Task) -> TimerHandle {
        tracing::debug!(timer = %self.name, ?delay, "scheduling task");
        self.schedule(Instant::now().checked_add(delay), Job::Once(task))
    }

    /// A zero `period` is refused: the returned handle is already cancelled
    /// and `task` never runs.
    fn every(&self, initial_delay: Duration, period: Duration, task: Periodic) -> TimerHandle {
        if period.is_zero() {
            tracing::warn!(timer = %self.name, "refusing periodic task with a zero period");
            let handle = TimerHandle::default();
            handle.cancel();
            return handle;
        }
        tracing::debug!(timer = %self.name, ?initial_delay, ?period, "scheduling periodic task");
        self.schedule(
            Instant::now().checked_add(initial_delay),
            Job::Every { task, period },
        )
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.thread.get_mut().take() {
            // Cancelled entries are dropped on the timer thread and may hold
            // the last reference to this timer.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
