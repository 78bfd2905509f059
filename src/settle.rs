//! The settlement core shared by every promise.
//!
//! A [`Deferred`] and the [`Promise`]s handed out from it share one core. The
//! core holds the state, the settled outcome and the registered listeners
//! behind a single lock. Settling a promise flips the state under that lock,
//! wakes blocked waiters and then, with the lock released, queues one task per
//! listener on the promise's own ordered dispatcher. Listeners can therefore
//! call back into any promise, this one included, without deadlocking.
use crate::diagnostics::{panic_message, Diagnostics};
use crate::dispatcher::OrderedDispatcher;
use crate::runtime::Runtime;
use crate::{Cause, Error, PromiseState};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// What a settled promise holds: its value, or the cause of its failure.
pub type Outcome<V> = Result<V, Cause>;

/// Opaque progress report passed from a deferred to its progress listeners.
pub type Progress = Arc<dyn Any + Send + Sync>;

/// Bound for anything a promise can settle with.
///
/// The value is shared by every listener, so it has to be cheap to hand out
/// across threads. Wrap large or non-`Clone` values in an `Arc`.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) type Listener<V> = Arc<dyn Fn(&Outcome<V>) + Send + Sync>;
type ProgressListener = Arc<dyn Fn(&Progress) + Send + Sync>;
type CancelHandler = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct Registered<L> {
    id: ListenerId,
    listener: L,
}

struct Inner<V> {
    state: PromiseState,
    outcome: Option<Arc<Outcome<V>>>,
    // Copy-on-write: settlement takes the whole list, registration clones it
    // only if a settlement snapshot is still alive.
    listeners: Arc<Vec<Registered<Listener<V>>>>,
    progress: Arc<Vec<Registered<ProgressListener>>>,
    wakers: Vec<Waker>,
    cancel_handler: Option<CancelHandler>,
    handled: bool,
}

pub(crate) struct Core<V> {
    seq: u64,
    name: Mutex<Option<Arc<str>>>,
    runtime: Runtime,
    dispatcher: OrderedDispatcher,
    inner: Mutex<Inner<V>>,
    settled: Condvar,
}

/// Wraps a one-shot callback so it can live in a shared listener list.
pub(crate) fn once<V, F>(f: F) -> Listener<V>
where
    F: FnOnce(&Outcome<V>) + Send + 'static,
{
    let slot = Mutex::new(Some(f));
    Arc::new(move |outcome: &Outcome<V>| {
        if let Some(f) = slot.lock().take() {
            f(outcome)
        }
    })
}

/// Runs a user handler, turning a panic into a rejection.
pub(crate) fn guarded<T, F>(f: F) -> Outcome<T>
where
    F: FnOnce() -> Outcome<T>,
{
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref())).into()))
}

fn notify<V>(diagnostics: &dyn Diagnostics, promise: &str, listener: &Listener<V>, outcome: &Outcome<V>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(outcome))) {
        diagnostics.listener_panicked(promise, &panic_message(payload.as_ref()));
    }
}

impl<V: Value> Core<V> {
    pub(crate) fn new(runtime: &Runtime) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let core = Arc::new(Core {
            seq: NEXT.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(None),
            runtime: runtime.clone(),
            dispatcher: runtime.dispatcher(),
            inner: Mutex::new(Inner {
                state: PromiseState::Waiting,
                outcome: None,
                listeners: Arc::default(),
                progress: Arc::default(),
                wakers: Vec::new(),
                cancel_handler: None,
                handled: false,
            }),
            settled: Condvar::new(),
        });
        runtime.diagnostics().promise_created(&core.id());
        core
    }

    pub(crate) fn id(&self) -> Arc<str> {
        self.name
            .lock()
            .get_or_insert_with(|| format!("promise-{}", self.seq).into())
            .clone()
    }

    fn identify(&self, name: &str) {
        *self.name.lock() = Some(name.into());
    }

    fn state(&self) -> PromiseState {
        self.inner.lock().state
    }

    fn pending(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PromiseState::Waiting {
            inner.state = PromiseState::Pending;
            tracing::trace!(promise = %self.id(), "promise pending");
        }
    }

    pub(crate) fn settle(&self, state: PromiseState, outcome: Outcome<V>) -> Result<(), Error> {
        self.transition(state, outcome).map_err(|current| {
            let promise = self.id().to_string();
            tracing::warn!(%promise, state = %current, "settlement attempt on a settled promise");
            Error::AlreadySettled {
                promise,
                state: current,
            }
        })
    }

    /// The terminal transition. Returns the current state if another
    /// settlement got there first.
    fn transition(&self, state: PromiseState, outcome: Outcome<V>) -> Result<(), PromiseState> {
        debug_assert!(state.is_done());
        let (outcome, listeners, wakers, cancel_handler) = {
            let mut inner = self.inner.lock();
            if inner.state.is_done() {
                return Err(inner.state);
            }
            inner.state = state;
            let outcome = Arc::new(outcome);
            inner.outcome = Some(outcome.clone());
            inner.progress = Arc::default();
            (
                outcome,
                mem::take(&mut inner.listeners),
                mem::take(&mut inner.wakers),
                inner.cancel_handler.take(),
            )
        };
        self.settled.notify_all();
        drop(cancel_handler);

        let id = self.id();
        tracing::trace!(promise = %id, %state, listeners = listeners.len(), "promise settled");
        for waker in wakers {
            waker.wake();
        }
        for registered in listeners.iter() {
            let listener = registered.listener.clone();
            let outcome = outcome.clone();
            let diagnostics = self.runtime.diagnostics();
            let id = id.clone();
            self.dispatcher
                .submit(move || notify(diagnostics.as_ref(), &id, &listener, &outcome));
        }
        Ok(())
    }

    /// Registers `listener`. A listener added after settlement runs right
    /// away on the calling thread and is never queued.
    pub(crate) fn listen(&self, listener: Listener<V>, handles_failure: bool) -> ListenerId {
        let id = ListenerId::next();
        let settled = {
            let mut inner = self.inner.lock();
            inner.handled |= handles_failure;
            match &inner.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    Arc::make_mut(&mut inner.listeners).push(Registered {
                        id,
                        listener: listener.clone(),
                    });
                    None
                }
            }
        };
        if let Some(outcome) = settled {
            notify(
                self.runtime.diagnostics().as_ref(),
                &self.id(),
                &listener,
                &outcome,
            );
        }
        id
    }

    pub(crate) fn unlisten(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.listeners.iter().any(|registered| registered.id == id) {
            return false;
        }
        Arc::make_mut(&mut inner.listeners).retain(|registered| registered.id != id);
        true
    }

    fn on_progress(&self, listener: ProgressListener) -> ListenerId {
        let id = ListenerId::next();
        let mut inner = self.inner.lock();
        if !inner.state.is_done() {
            Arc::make_mut(&mut inner.progress).push(Registered { id, listener });
        }
        id
    }

    fn remove_progress_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.progress.iter().any(|registered| registered.id == id) {
            return false;
        }
        Arc::make_mut(&mut inner.progress).retain(|registered| registered.id != id);
        true
    }

    fn progress(&self, progress: Progress) -> Result<(), Error> {
        let listeners = {
            let inner = self.inner.lock();
            if inner.state.is_done() {
                return Err(Error::AlreadySettled {
                    promise: self.id().to_string(),
                    state: inner.state,
                });
            }
            inner.progress.clone()
        };
        for registered in listeners.iter() {
            let listener = &registered.listener;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&progress))) {
                self.runtime
                    .diagnostics()
                    .listener_panicked(&self.id(), &panic_message(payload.as_ref()));
            }
        }
        Ok(())
    }

    fn set_cancel_handler(&self, handler: CancelHandler) {
        let mut inner = self.inner.lock();
        if !inner.state.is_done() {
            inner.cancel_handler = Some(handler);
        }
    }

    fn cancel(&self) -> bool {
        let handler = self.inner.lock().cancel_handler.clone();
        let Some(handler) = handler else {
            return false;
        };
        if !handler() {
            return false;
        }
        tracing::trace!(promise = %self.id(), "cancellation accepted");
        // The producer may have settled while the handler ran.
        let _ = self.transition(PromiseState::Cancelled, Err(Error::Cancelled.into()));
        true
    }

    fn await_done(&self) {
        let mut inner = self.inner.lock();
        while !inner.state.is_done() {
            tracing::trace!(promise = %self.id(), "awaiting settlement");
            self.settled.wait(&mut inner);
        }
    }

    /// A timeout too large to form a deadline waits without one.
    fn await_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.await_done();
            return Ok(());
        };
        let mut inner = self.inner.lock();
        while !inner.state.is_done() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            self.settled.wait_until(&mut inner, deadline);
        }
        Ok(())
    }

    fn outcome_now(&self) -> Option<Arc<Outcome<V>>> {
        self.inner.lock().outcome.clone()
    }

    /// Blocks for the outcome and marks a failure as seen by the caller.
    fn take_outcome(&self) -> Outcome<V> {
        self.await_done();
        let mut inner = self.inner.lock();
        inner.handled = true;
        match &inner.outcome {
            Some(outcome) => (**outcome).clone(),
            None => Err(Error::DeferredDropped.into()),
        }
    }

    /// Like `take_outcome` but never blocks.
    fn take_now(&self) -> Option<Outcome<V>> {
        let mut inner = self.inner.lock();
        let outcome = inner.outcome.clone()?;
        inner.handled = true;
        Some((*outcome).clone())
    }

    fn poll_outcome(&self, waker: &Waker) -> Option<Outcome<V>> {
        let mut inner = self.inner.lock();
        match &inner.outcome {
            Some(outcome) => {
                let outcome = (**outcome).clone();
                inner.handled = true;
                Some(outcome)
            }
            None => {
                if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
                    inner.wakers.push(waker.clone());
                }
                None
            }
        }
    }
}

impl<V> Drop for Core<V> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state != PromiseState::Failed || inner.handled {
            return;
        }
        if let Some(Err(cause)) = inner.outcome.as_deref() {
            let name = self.name.get_mut().clone();
            let id = name.unwrap_or_else(|| format!("promise-{}", self.seq).into());
            self.runtime.diagnostics().unhandled_rejection(&id, cause);
        }
    }
}

/// The read side of a promise. Cheap to clone; every clone observes the same
/// settlement.
pub struct Promise<V> {
    pub(crate) core: Arc<Core<V>>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Promise {
            core: self.core.clone(),
        }
    }
}

impl<V: Value> Promise<V> {
    pub fn id(&self) -> Arc<str> {
        self.core.id()
    }

    pub fn state(&self) -> PromiseState {
        self.core.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Blocks until settled, then reports whether the promise succeeded.
    pub fn is_success(&self) -> bool {
        self.core.await_done();
        self.state() == PromiseState::Succeeded
    }

    /// Blocks until settled, then reports whether the promise failed.
    pub fn is_failure(&self) -> bool {
        self.core.await_done();
        self.state() == PromiseState::Failed
    }

    /// Blocks until settled, then reports whether the promise was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.core.await_done();
        self.state() == PromiseState::Cancelled
    }

    pub fn runtime(&self) -> &Runtime {
        &self.core.runtime
    }

    /// Blocks the calling thread until the promise settles and returns the
    /// outcome.
    ///
    /// ```
    /// use deferred_promise::Runtime;
    /// use std::thread;
    ///
    /// let runtime = Runtime::new();
    /// let deferred = runtime.defer::<String>();
    /// let promise = deferred.promise();
    /// let task = thread::spawn(move || deferred.success("🍓".into()));
    /// assert_eq!(promise.wait().unwrap(), "🍓");
    /// task.join().unwrap().unwrap();
    /// ```
    pub fn wait(&self) -> Outcome<V> {
        self.core.take_outcome()
    }

    pub fn await_done(&self) -> &Self {
        self.core.await_done();
        self
    }

    /// Waits at most `timeout`. Expiry never changes the promise.
    pub fn await_timeout(&self, timeout: Duration) -> Result<&Self, Error> {
        self.core.await_timeout(timeout)?;
        Ok(self)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<V, Error> {
        self.core.await_timeout(timeout)?;
        self.wait().map_err(Error::Rejected)
    }

    pub fn outcome_now(&self) -> Option<Outcome<V>> {
        self.core.outcome_now().map(|outcome| (*outcome).clone())
    }

    pub fn value_now(&self) -> Option<V> {
        self.outcome_now().and_then(Result::ok)
    }

    pub fn cause_now(&self) -> Option<Cause> {
        self.outcome_now().and_then(Result::err)
    }

    /// Registers a pair of callbacks; exactly one of them runs once the
    /// promise settles.
    pub fn add_listener<S, F>(&self, on_success: S, on_failure: F) -> ListenerId
    where
        S: FnOnce(&V) + Send + 'static,
        F: FnOnce(&Cause) + Send + 'static,
    {
        self.core.listen(
            once(move |outcome: &Outcome<V>| match outcome {
                Ok(value) => on_success(value),
                Err(cause) => on_failure(cause),
            }),
            true,
        )
    }

    /// Runs `f` on success. Does not count as handling a failure.
    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&V) + Send + 'static,
    {
        self.core.listen(
            once(move |outcome: &Outcome<V>| {
                if let Ok(value) = outcome {
                    f(value)
                }
            }),
            false,
        );
        self
    }

    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&Cause) + Send + 'static,
    {
        self.core.listen(
            once(move |outcome: &Outcome<V>| {
                if let Err(cause) = outcome {
                    f(cause)
                }
            }),
            true,
        );
        self
    }

    pub fn on_done<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(&Outcome<V>) + Send + 'static,
    {
        self.core.listen(once(f), true)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.unlisten(id)
    }

    /// Listens for progress reports. Ignored once the promise has settled.
    pub fn on_progress<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.core.on_progress(Arc::new(f))
    }

    pub fn remove_progress_listener(&self, id: ListenerId) -> bool {
        self.core.remove_progress_listener(id)
    }

    /// Asks the producer to stop. Returns `false` when no cancellation handler
    /// is installed or the handler refused.
    pub fn cancel(&self) -> bool {
        self.core.cancel()
    }

    pub(crate) fn downgrade(&self) -> WeakPromise<V> {
        WeakPromise {
            core: Arc::downgrade(&self.core),
        }
    }

    pub(crate) fn take_now(&self) -> Option<Outcome<V>> {
        self.core.take_now()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.core.inner.lock().listeners.len()
    }

    pub(crate) fn same_as(&self, other: &Promise<V>) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<V: Value> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl<V: Value> Future for Promise<V> {
    type Output = Outcome<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.core.poll_outcome(cx.waker()) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

pub(crate) struct WeakPromise<V> {
    core: Weak<Core<V>>,
}

impl<V: Value> WeakPromise<V> {
    pub(crate) fn upgrade(&self) -> Option<Promise<V>> {
        self.core.upgrade().map(|core| Promise { core })
    }

    pub(crate) fn unlisten(&self, id: ListenerId) {
        if let Some(core) = self.core.upgrade() {
            if core.unlisten(id) {
                tracing::debug!(promise = %core.id(), ?id, "listener detached");
            }
        }
    }
}

struct Writer<V: Value> {
    core: Arc<Core<V>>,
}

impl<V: Value> Drop for Writer<V> {
    /// If this is an unsettled deferred that someone still observes, fail it.
    fn drop(&mut self) {
        if !self.core.state().is_done() && Arc::strong_count(&self.core) > 1 {
            tracing::debug!(promise = %self.core.id(), "deferred dropped before settlement");
            let _ = self
                .core
                .transition(PromiseState::Failed, Err(Error::DeferredDropped.into()));
        }
    }
}

/// The write side of a promise.
///
/// All clones of a deferred write to the same promise, and only the first
/// settlement takes effect: later ones return [`Error::AlreadySettled`].
/// Dropping every clone of an unsettled deferred fails its promise with
/// [`Error::DeferredDropped`].
pub struct Deferred<V: Value> {
    writer: Arc<Writer<V>>,
}

impl<V: Value> Clone for Deferred<V> {
    fn clone(&self) -> Self {
        Deferred {
            writer: self.writer.clone(),
        }
    }
}

impl<V: Value> Deferred<V> {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Deferred {
            writer: Arc::new(Writer {
                core: Core::new(runtime),
            }),
        }
    }

    fn core(&self) -> &Arc<Core<V>> {
        &self.writer.core
    }

    pub fn promise(&self) -> Promise<V> {
        Promise {
            core: self.core().clone(),
        }
    }

    pub fn id(&self) -> Arc<str> {
        self.core().id()
    }

    pub fn identify(self, name: &str) -> Self {
        self.core().identify(name);
        self
    }

    pub fn state(&self) -> PromiseState {
        self.core().state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.core().runtime
    }

    /// Marks the work as started. No-op unless still waiting.
    pub fn pending(&self) -> &Self {
        self.core().pending();
        self
    }

    pub fn success(&self, value: V) -> Result<(), Error> {
        self.core().settle(PromiseState::Succeeded, Ok(value))
    }

    pub fn failure(&self, cause: impl Into<Cause>) -> Result<(), Error> {
        self.core()
            .settle(PromiseState::Failed, Err(cause.into()))
    }

    /// Settles the promise as cancelled.
    pub fn cancel(&self) -> Result<(), Error> {
        self.core()
            .settle(PromiseState::Cancelled, Err(Error::Cancelled.into()))
    }

    pub fn settle(&self, outcome: Outcome<V>) -> Result<(), Error> {
        match outcome {
            Ok(value) => self.success(value),
            Err(cause) => self.failure(cause),
        }
    }

    /// Settles unless something else already did. Used where losing the race
    /// is expected, such as combinators and cancelled downstream promises.
    pub(crate) fn offer(&self, outcome: Outcome<V>) -> bool {
        let state = match &outcome {
            Ok(_) => PromiseState::Succeeded,
            Err(cause) if matches!(cause.downcast_ref::<Error>(), Some(Error::Cancelled)) => {
                PromiseState::Cancelled
            }
            Err(_) => PromiseState::Failed,
        };
        self.core().transition(state, outcome).is_ok()
    }

    pub fn progress<P>(&self, progress: P) -> Result<(), Error>
    where
        P: Any + Send + Sync,
    {
        self.core().progress(Arc::new(progress))
    }

    /// Installs the handler [`Promise::cancel`] delegates to. The handler
    /// returns whether it managed to stop the work.
    pub fn on_cancel<F>(&self, handler: F) -> &Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.core().set_cancel_handler(Arc::new(handler));
        self
    }

    /// Runs `f` on this thread and settles with its result. A panic in `f`
    /// becomes an [`Error::Panicked`] failure.
    pub fn run_blocking<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce() -> Outcome<V>,
    {
        self.pending();
        self.settle(guarded(f))
    }

    /// Like [`run_blocking`](Self::run_blocking) but on the runtime's executor.
    pub fn run_async<F>(&self, f: F) -> Promise<V>
    where
        F: FnOnce() -> Outcome<V> + Send + 'static,
    {
        let deferred = self.clone();
        self.runtime().executor().submit(Box::new(move || {
            if let Err(error) = deferred.run_blocking(f) {
                tracing::warn!(promise = %deferred.id(), %error, "async result discarded");
            }
        }));
        self.promise()
    }

    /// Settles this deferred with whatever `source` settles with.
    pub fn bind(&self, source: &Promise<V>) -> Result<(), Error> {
        if source.same_as(&self.promise()) {
            return Err(Error::SelfBinding);
        }
        let target = self.clone();
        source.core.listen(
            once(move |outcome: &Outcome<V>| {
                target.offer(outcome.clone());
            }),
            true,
        );
        Ok(())
    }
}

impl<V: Value> fmt::Debug for Deferred<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::diagnostics::Diagnostics;
    use crate::executor::Inline;
    use crate::{Cause, Error, PromiseState, Runtime};
    use futures::executor::block_on;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        unhandled: AtomicUsize,
        panics: AtomicUsize,
    }

    impl Diagnostics for Recorded {
        fn unhandled_rejection(&self, _: &str, _: &Cause) {
            self.unhandled.fetch_add(1, Ordering::SeqCst);
        }

        fn listener_panicked(&self, _: &str, _: &str) {
            self.panics.fetch_add(1, Ordering::SeqCst);
        }

        fn task_panicked(&self, _: &str) {}
    }

    fn inline(diagnostics: Arc<Recorded>) -> Runtime {
        Runtime::builder()
            .executor(Arc::new(Inline))
            .diagnostics(diagnostics)
            .build()
    }

    #[test]
    fn test_second_settlement_is_rejected() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>().identify("answer");
        deferred.success(1).unwrap();
        let error = deferred.failure(Cause::msg("late")).unwrap_err();
        assert!(matches!(
            error,
            Error::AlreadySettled { ref promise, state: PromiseState::Succeeded } if promise == "answer"
        ));
        assert_eq!(deferred.promise().value_now(), Some(1));
    }

    #[test]
    fn test_pending_only_moves_forward() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>();
        assert_eq!(deferred.state(), PromiseState::Waiting);
        deferred.pending();
        assert_eq!(deferred.state(), PromiseState::Pending);
        deferred.success(1).unwrap();
        deferred.pending();
        assert_eq!(deferred.state(), PromiseState::Succeeded);
    }

    #[test]
    fn test_generated_id() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<()>();
        assert!(deferred.id().starts_with("promise-"));
        assert_eq!(deferred.id(), deferred.promise().id());
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let runtime = Runtime::new();
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let seen = seen.clone();
            promise.on_success(move |v| seen.lock().push(i * v));
        }
        deferred.success(2).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        promise.on_done(move |_| tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        while seen.lock().len() < 20 {
            thread::yield_now();
        }
        assert_eq!(*seen.lock(), (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_listener_after_settlement_runs_synchronously() {
        let runtime = Runtime::new();
        let promise = runtime.resolved("done");
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        promise.on_success(move |v| *sink.lock() = Some(*v));
        assert_eq!(*seen.lock(), Some("done"));
    }

    #[test]
    fn test_removed_listener_never_runs() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = promise.add_listener(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );
        assert!(promise.remove_listener(id));
        assert!(!promise.remove_listener(id));
        deferred.success(1).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_await_timeout_leaves_state_alone() {
        let runtime = Runtime::new();
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        assert!(matches!(
            promise.await_timeout(Duration::from_millis(20)),
            Err(Error::Timeout(_))
        ));
        assert_eq!(promise.state(), PromiseState::Waiting);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            deferred.success(9).unwrap();
        });
        assert_eq!(promise.wait_timeout(Duration::from_secs(5)).unwrap(), 9);
    }

    #[test]
    fn test_dropping_every_deferred_fails_the_promise() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        let clone = deferred.clone();
        drop(deferred);
        assert!(!promise.is_done());
        drop(clone);
        let cause = promise.wait().unwrap_err();
        assert!(matches!(cause.downcast_ref::<Error>(), Some(Error::DeferredDropped)));
    }

    #[test]
    fn test_progress_reaches_listeners_until_settled() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<()>();
        let promise = deferred.promise();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        promise.on_progress(move |p| {
            if let Some(percent) = p.downcast_ref::<u8>() {
                sink.lock().push(*percent);
            }
        });
        deferred.progress(10u8).unwrap();
        deferred.progress(90u8).unwrap();
        deferred.success(()).unwrap();
        assert!(deferred.progress(100u8).is_err());
        assert_eq!(*seen.lock(), vec![10, 90]);
    }

    #[test]
    fn test_cancel_needs_accepting_handler() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        deferred.on_cancel(|| false);
        assert!(!promise.cancel());
        assert_eq!(promise.state(), PromiseState::Waiting);
        deferred.on_cancel(|| true);
        assert!(promise.cancel());
        assert_eq!(promise.state(), PromiseState::Cancelled);
        assert!(deferred.success(1).is_err());
    }

    #[test]
    fn test_unhandled_rejection_reported_once() {
        let diagnostics = Arc::new(Recorded::default());
        let runtime = inline(diagnostics.clone());
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        deferred.failure(Cause::msg("nobody listens")).unwrap();
        for _ in 0..3 {
            assert!(promise.cause_now().is_some());
        }
        let clone = promise.clone();
        drop(promise);
        drop(deferred);
        assert_eq!(diagnostics.unhandled.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(diagnostics.unhandled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handled_rejection_not_reported() {
        let diagnostics = Arc::new(Recorded::default());
        let runtime = inline(diagnostics.clone());
        let deferred = runtime.defer::<i32>();
        deferred.promise().on_failure(|_| {});
        deferred.failure(Cause::msg("seen")).unwrap();
        let waited = runtime.rejected::<i32>(Cause::msg("waited"));
        assert!(waited.wait().is_err());
        drop(waited);
        drop(deferred);
        assert_eq!(diagnostics.unhandled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_reported() {
        let diagnostics = Arc::new(Recorded::default());
        let runtime = inline(diagnostics.clone());
        let deferred = runtime.defer::<i32>();
        let promise = deferred.promise();
        promise.on_success(|_| panic!("listener bug"));
        let after = Arc::new(AtomicUsize::new(0));
        let counter = after.clone();
        promise.on_success(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        deferred.success(1).unwrap();
        assert_eq!(diagnostics.panics.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_blocking_turns_panic_into_failure() {
        let runtime = inline(Arc::default());
        let deferred = runtime.defer::<i32>();
        deferred
            .run_blocking(|| panic!("inside work"))
            .unwrap();
        let cause = deferred.promise().wait().unwrap_err();
        assert!(matches!(cause.downcast_ref::<Error>(), Some(Error::Panicked(_))));
    }

    #[test]
    fn test_bind_mirrors_source() {
        let runtime = inline(Arc::default());
        let source = runtime.defer::<i32>();
        let target = runtime.defer::<i32>();
        target.bind(&source.promise()).unwrap();
        assert!(matches!(target.bind(&target.promise()), Err(Error::SelfBinding)));
        source.success(5).unwrap();
        assert_eq!(target.promise().value_now(), Some(5));
    }

    #[test]
    fn test_promise_is_a_future() {
        let runtime = Runtime::new();
        let deferred = runtime.defer::<String>();
        let promise = deferred.promise();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let promise = promise.clone();
                thread::spawn(move || block_on(promise))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        deferred.success("🍓".to_string()).unwrap();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), "🍓");
        }
    }
}
