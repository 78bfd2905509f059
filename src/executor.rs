//! The work-execution capability the rest of the crate runs on.
//!
//! An [`Executor`] only promises to run a submitted task at some point, on some
//! thread. Ordering on top of that is the job of
//! [`OrderedDispatcher`](crate::dispatcher::OrderedDispatcher).
use crate::diagnostics::panic_message;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Unbounded pool of named worker threads.
///
/// A task goes to an idle worker when there is one and to a new thread
/// otherwise, so a task that blocks never holds up the ones behind it. Workers
/// that stay idle for the keep-alive exit; dropping the pool lets the rest
/// finish the queue and exit.
pub struct CachedPool {
    name: String,
    shared: Arc<PoolShared>,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
    keep_alive: Duration,
}

#[derive(Default)]
struct PoolQueue {
    tasks: VecDeque<Task>,
    idle: usize,
    live: usize,
    spawned: usize,
    shutdown: bool,
}

impl CachedPool {
    pub fn new(name: impl Into<String>) -> Self {
        CachedPool::with_keep_alive(name, Duration::from_secs(60))
    }

    pub fn with_keep_alive(name: impl Into<String>, keep_alive: Duration) -> Self {
        CachedPool {
            name: name.into(),
            shared: Arc::new(PoolShared {
                queue: Mutex::new(PoolQueue::default()),
                available: Condvar::new(),
                keep_alive,
            }),
        }
    }

    /// Worker threads alive right now, busy or idle.
    pub fn workers(&self) -> usize {
        self.shared.queue.lock().live
    }

    fn spawn_worker(&self, n: usize) {
        let name = format!("{}-{}", self.name, n);
        let shared = self.shared.clone();
        if let Err(error) = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.work())
        {
            // The task stays queued for the next worker.
            tracing::error!(thread = %name, %error, "failed to spawn worker thread");
            self.shared.queue.lock().live -= 1;
        }
    }
}

impl Default for CachedPool {
    fn default() -> Self {
        CachedPool::new("promise-worker")
    }
}

impl fmt::Debug for CachedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("CachedPool")
            .field("name", &self.name)
            .field("live", &queue.live)
            .field("idle", &queue.idle)
            .field("queued", &queue.tasks.len())
            .finish()
    }
}

impl Executor for CachedPool {
    fn submit(&self, task: Task) {
        let spawn = {
            let mut queue = self.shared.queue.lock();
            queue.tasks.push_back(task);
            if queue.idle >= queue.tasks.len() {
                self.shared.available.notify_one();
                None
            } else {
                queue.spawned += 1;
                queue.live += 1;
                Some(queue.spawned)
            }
        };
        if let Some(n) = spawn {
            self.spawn_worker(n);
        }
    }
}

impl Drop for CachedPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
    }
}

impl PoolShared {
    fn work(&self) {
        let mut queue = self.queue.lock();
        loop {
            if let Some(task) = queue.tasks.pop_front() {
                MutexGuard::unlocked(&mut queue, || {
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(%message, "worker task panicked");
                    }
                });
                continue;
            }
            if queue.shutdown {
                break;
            }
            queue.idle += 1;
            let timed_out = self.available.wait_for(&mut queue, self.keep_alive).timed_out();
            queue.idle -= 1;
            if timed_out && queue.tasks.is_empty() {
                break;
            }
        }
        queue.live -= 1;
    }
}

/// Runs every task on the submitting thread before the outermost `submit`
/// returns.
///
/// A task submitted while another inline task is running on the same thread
/// is queued and run once that task returns, so long listener chains do not
/// grow the stack. Useful for deterministic tests; listeners then run before
/// `success` returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

thread_local! {
    static INLINE_QUEUE: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

impl Executor for Inline {
    fn submit(&self, task: Task) {
        let first = INLINE_QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            match queue.as_mut() {
                Some(pending) => {
                    pending.push_back(task);
                    None
                }
                None => {
                    *queue = Some(VecDeque::new());
                    Some(task)
                }
            }
        });
        let Some(mut task) = first else {
            return;
        };

        let mut panicked = None;
        loop {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                panicked.get_or_insert(payload);
            }
            let next = INLINE_QUEUE
                .with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front));
            match next {
                Some(next) => task = next,
                None => break,
            }
        }
        INLINE_QUEUE.with(|queue| queue.borrow_mut().take());
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
    }
}

impl Executor for futures::executor::ThreadPool {
    fn submit(&self, task: Task) {
        self.spawn_ok(async move { task() })
    }
}

#[cfg(test)]
mod tests {
    use super::{CachedPool, Executor, Inline};
    use std::panic::AssertUnwindSafe;
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_inline_runs_before_returning() {
        let (tx, rx) = channel();
        Inline.submit(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_inline_queues_nested_submissions() {
        let (tx, rx) = channel();
        let nested = tx.clone();
        Inline.submit(Box::new(move || {
            let inner = nested.clone();
            Inline.submit(Box::new(move || inner.send("nested").unwrap()));
            nested.send("outer").unwrap();
        }));
        tx.send("returned").unwrap();
        let order: Vec<_> = rx.try_iter().collect();
        assert_eq!(order, vec!["outer", "nested", "returned"]);
    }

    #[test]
    fn test_inline_deep_nesting_keeps_stack_flat() {
        fn countdown(n: usize, tx: std::sync::mpsc::Sender<usize>) {
            if n == 0 {
                tx.send(0).unwrap();
                return;
            }
            Inline.submit(Box::new(move || countdown(n - 1, tx)));
        }
        let (tx, rx) = channel();
        countdown(200_000, tx);
        assert_eq!(rx.try_recv().unwrap(), 0);
    }

    #[test]
    fn test_inline_panic_reaches_outer_caller_after_queue_drains() {
        let (tx, rx) = channel();
        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            Inline.submit(Box::new(move || {
                Inline.submit(Box::new(move || tx.send("still ran").unwrap()));
                panic!("inline task");
            }))
        }));
        assert!(result.is_err());
        assert_eq!(rx.try_recv().unwrap(), "still ran");
        let (tx, rx) = channel();
        Inline.submit(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_cached_pool_names_threads() {
        let executor = CachedPool::new("worker");
        let (tx, rx) = channel();
        executor.submit(Box::new(move || {
            tx.send(thread::current().name().map(String::from)).unwrap()
        }));
        assert_eq!(rx.recv().unwrap().as_deref(), Some("worker-1"));
    }

    #[test]
    fn test_cached_pool_reuses_idle_worker() {
        let executor = CachedPool::new("reuse");
        let (tx, rx) = channel();
        for _ in 0..5 {
            let tx = tx.clone();
            executor.submit(Box::new(move || {
                tx.send(thread::current().name().map(String::from)).unwrap()
            }));
            assert_eq!(rx.recv().unwrap().as_deref(), Some("reuse-1"));
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(executor.workers(), 1);
    }

    #[test]
    fn test_cached_pool_grows_past_blocked_tasks() {
        let executor = CachedPool::new("blocked");
        let (release, blocked) = channel::<()>();
        let (tx, rx) = channel();
        executor.submit(Box::new(move || {
            blocked.recv().unwrap();
            tx.send("first").unwrap()
        }));
        executor.submit(Box::new(move || release.send(()).unwrap()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(executor.workers(), 2);
    }

    #[test]
    fn test_cached_pool_idle_workers_expire() {
        let executor = CachedPool::with_keep_alive("expiring", Duration::from_millis(20));
        let (tx, rx) = channel();
        executor.submit(Box::new(move || tx.send(()).unwrap()));
        rx.recv().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while executor.workers() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(executor.workers(), 0);
    }

    #[test]
    fn test_futures_thread_pool_adapter() {
        let pool = futures::executor::ThreadPool::new().unwrap();
        let (tx, rx) = channel();
        pool.submit(Box::new(move || tx.send("🍓").unwrap()));
        assert_eq!(rx.recv().unwrap(), "🍓");
    }
}
