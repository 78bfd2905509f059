//! The context every promise is created from.
//!
//! A [`Runtime`] bundles the executor listeners run on, the timer used for
//! delayed work and the diagnostics sink. There is no global default: build
//! one runtime, clone it wherever promises are created. Every promise keeps its
//! runtime alive, and the default timer thread is joined once the last handle
//! is gone.
use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::dispatcher::OrderedDispatcher;
use crate::executor::{CachedPool, Executor};
use crate::external::{self, ExternalHandle};
use crate::flow::Publisher;
use crate::sequence::{self, DeferredSeq, PromiseSeq};
use crate::settle::{Deferred, Outcome, Promise, Value};
use crate::timer::{ThreadTimer, TimerHandle, TimerService};
use crate::{Cause, Error};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Prefix for the threads of the default executor.
    pub worker_name: String,
    /// Name of the default timer thread.
    pub timer_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_name: "promise-worker".to_string(),
            timer_name: "promise-timer".to_string(),
        }
    }
}

#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    executor: Option<Arc<dyn Executor>>,
    timer: Option<Arc<dyn TimerService>>,
    diagnostics: Option<Arc<dyn Diagnostics>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        RuntimeBuilder::default()
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_name = name.into();
        self
    }

    pub fn timer_name(mut self, name: impl Into<String>) -> Self {
        self.config.timer_name = name.into();
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn TimerService>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn Diagnostics>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn build(self) -> Runtime {
        let RuntimeBuilder {
            config,
            executor,
            timer,
            diagnostics,
        } = self;
        let executor = executor
            .unwrap_or_else(|| Arc::new(CachedPool::new(config.worker_name.clone())));
        let timer = timer.unwrap_or_else(|| {
            Arc::new(ThreadTimer::new(config.timer_name.clone(), executor.clone()))
        });
        let diagnostics = diagnostics.unwrap_or_else(|| Arc::new(TracingDiagnostics));
        tracing::debug!(?config, "runtime built");
        Runtime {
            shared: Arc::new(Shared {
                config,
                executor,
                timer,
                diagnostics,
            }),
        }
    }
}

struct Shared {
    config: RuntimeConfig,
    executor: Arc<dyn Executor>,
    timer: Arc<dyn TimerService>,
    diagnostics: Arc<dyn Diagnostics>,
}

#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new() -> Self {
        RuntimeBuilder::new().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.shared.executor
    }

    pub fn timer(&self) -> &Arc<dyn TimerService> {
        &self.shared.timer
    }

    pub fn diagnostics(&self) -> Arc<dyn Diagnostics> {
        self.shared.diagnostics.clone()
    }

    /// A fresh ordered dispatcher over this runtime's executor.
    pub fn dispatcher(&self) -> OrderedDispatcher {
        OrderedDispatcher::new(self.shared.executor.clone(), self.shared.diagnostics.clone())
    }

    pub fn defer<V: Value>(&self) -> Deferred<V> {
        Deferred::new(self)
    }

    pub fn defer_pending<V: Value>(&self) -> Deferred<V> {
        let deferred = self.defer();
        deferred.pending();
        deferred
    }

    pub fn defer_seq<E: Value>(&self) -> DeferredSeq<E> {
        DeferredSeq::new(self)
    }

    pub fn resolved<V: Value>(&self, value: V) -> Promise<V> {
        let deferred = self.defer();
        let _ = deferred.success(value);
        deferred.promise()
    }

    pub fn rejected<V: Value>(&self, cause: impl Into<Cause>) -> Promise<V> {
        let deferred = self.defer();
        let _ = deferred.failure(cause);
        deferred.promise()
    }

    /// Runs `f` on the executor and settles the returned promise with its
    /// result.
    pub fn spawn<V, F>(&self, f: F) -> Promise<V>
    where
        V: Value,
        F: FnOnce() -> Outcome<V> + Send + 'static,
    {
        self.defer().run_async(f)
    }

    /// Runs `f` on the executor with a sequence to append to. The sequence
    /// completes when `f` returns `Ok` unless `f` already settled it.
    pub fn spawn_seq<E, F>(&self, f: F) -> PromiseSeq<E>
    where
        E: Value,
        F: FnOnce(&DeferredSeq<E>) -> Result<(), Cause> + Send + 'static,
    {
        let deferred = self.defer_seq::<E>();
        let promise = deferred.promise();
        self.executor().submit(Box::new(move || {
            deferred.pending();
            let result = crate::settle::guarded(|| f(&deferred));
            if deferred.is_done() {
                return;
            }
            let _ = match result {
                Ok(()) => deferred.complete(),
                Err(cause) => deferred.failure(cause),
            };
        }));
        promise
    }

    /// Settles with `()` once `delay` has elapsed. Cancelling the promise
    /// cancels the timer.
    pub fn delay(&self, delay: Duration) -> Promise<()> {
        self.schedule(delay, || Ok(()))
    }

    /// Runs `f` on the executor after `delay`.
    pub fn schedule<V, F>(&self, delay: Duration, f: F) -> Promise<V>
    where
        V: Value,
        F: FnOnce() -> Outcome<V> + Send + 'static,
    {
        let deferred = self.defer::<V>();
        let task = deferred.clone();
        let handle = self.timer().after(
            delay,
            Box::new(move || {
                if !task.is_done() {
                    let _ = task.run_blocking(f);
                }
            }),
        );
        deferred.on_cancel(move || {
            handle.cancel();
            true
        });
        deferred.promise()
    }

    pub fn every<F>(&self, initial_delay: Duration, period: Duration, f: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer().every(initial_delay, period, Arc::new(f))
    }

    /// Blocks until every promise has settled, whatever the outcome.
    pub fn wait_all<V: Value>(&self, promises: &[Promise<V>]) {
        for promise in promises {
            promise.await_done();
        }
    }

    pub fn bind<V: Value>(&self, source: &Promise<V>, target: &Deferred<V>) -> Result<(), Error> {
        target.bind(source)
    }

    pub fn from_external<T: Value>(&self, handle: ExternalHandle<T>) -> Promise<T> {
        let deferred = self.defer::<T>();
        external::bind(handle, deferred.clone());
        deferred.promise()
    }

    pub fn from_future<T, F>(&self, future: F) -> Promise<T>
    where
        T: Value,
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let future: BoxFuture<'static, Outcome<T>> = Box::pin(future);
        self.from_external(ExternalHandle::Future(future))
    }

    pub fn from_thread<T: Value>(&self, handle: JoinHandle<Outcome<T>>) -> Promise<T> {
        self.from_external(ExternalHandle::Thread(handle))
    }

    /// Collects everything `publisher` emits, requesting one element at a
    /// time. Cancelling the returned sequence cancels the subscription.
    pub fn from_publisher<E: Value>(&self, publisher: &dyn Publisher<E>) -> PromiseSeq<E> {
        sequence::collect(self, publisher)
    }

    /// A sequence already completed with the items of `iter`.
    pub fn seq_from_iter<E, I>(&self, iter: I) -> PromiseSeq<E>
    where
        E: Value,
        I: IntoIterator<Item = E>,
    {
        let deferred = self.defer_seq();
        for item in iter {
            let _ = deferred.next(item);
        }
        let _ = deferred.complete();
        deferred.promise()
    }

    /// Runs `step` for each input strictly one after another, starting the
    /// next step only once the previous promise succeeded. The first failure
    /// fails the result and stops the loop.
    pub fn for_each_sequentially<I, O, F>(&self, inputs: Vec<I>, step: F) -> Promise<Vec<O>>
    where
        I: Send + 'static,
        O: Value,
        F: Fn(I) -> Promise<O> + Send + Sync + 'static,
    {
        let deferred = self.defer_pending::<Vec<O>>();
        let promise = deferred.promise();
        let looped = Arc::new(Sequential {
            inputs: Mutex::new(inputs.into_iter()),
            outputs: Mutex::new(Vec::new()),
            step,
            deferred,
        });
        looped.drive();
        promise
    }
}

struct Sequential<I, O: Value, F> {
    inputs: Mutex<std::vec::IntoIter<I>>,
    outputs: Mutex<Vec<O>>,
    step: F,
    deferred: Deferred<Vec<O>>,
}

impl<I, O, F> Sequential<I, O, F>
where
    I: Send + 'static,
    O: Value,
    F: Fn(I) -> Promise<O> + Send + Sync + 'static,
{
    /// Loops over already-settled steps instead of recursing through their
    /// listeners, so long runs of ready promises use constant stack.
    fn drive(self: Arc<Self>) {
        loop {
            if self.deferred.is_done() {
                return;
            }
            let Some(input) = self.inputs.lock().next() else {
                let outputs = std::mem::take(&mut *self.outputs.lock());
                self.deferred.offer(Ok(outputs));
                return;
            };
            let promise = match crate::settle::guarded(|| Ok((self.step)(input))) {
                Ok(promise) => promise,
                Err(cause) => {
                    self.deferred.offer(Err(cause));
                    return;
                }
            };
            match promise.take_now() {
                Some(outcome) => {
                    if !self.accept(outcome) {
                        return;
                    }
                }
                None => {
                    let next = self.clone();
                    promise.on_done(move |outcome| {
                        if next.accept(outcome.clone()) {
                            next.drive();
                        }
                    });
                    return;
                }
            }
        }
    }

    fn accept(&self, outcome: Outcome<O>) -> bool {
        match outcome {
            Ok(output) => {
                self.outputs.lock().push(output);
                true
            }
            Err(cause) => {
                self.deferred.offer(Err(cause));
                false
            }
        }
    }
}
