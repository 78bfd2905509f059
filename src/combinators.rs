//! Promises built from other promises.
//!
//! Every combinator creates a downstream deferred and wires it to its
//! source(s) through the settlement core's listener API. Handlers return
//! `Result`, so "throwing" is returning `Err`; a panicking handler rejects the
//! downstream promise with [`Error::Panicked`]. Cancelling a downstream promise
//! asks its source to cancel.
use crate::runtime::Runtime;
use crate::settle::{guarded, once, Deferred, ListenerId, Outcome, Promise, Value, WeakPromise};
use crate::{Cause, CauseFilter};
use parking_lot::Mutex;
use std::sync::Arc;

impl<V: Value> Promise<V> {
    /// Listens on `self` and hands the outcome plus a fresh downstream
    /// deferred to `f`.
    fn chain<U, F>(&self, f: F) -> Promise<U>
    where
        U: Value,
        F: FnOnce(Outcome<V>, &Deferred<U>) + Send + 'static,
    {
        let downstream = self.runtime().defer::<U>();
        let upstream = self.downgrade();
        downstream.on_cancel(move || upstream.upgrade().map_or(false, |source| source.cancel()));
        let target = downstream.clone();
        self.core.listen(
            once(move |outcome: &Outcome<V>| {
                if target.is_done() {
                    return;
                }
                target.pending();
                f(outcome.clone(), &target)
            }),
            true,
        );
        downstream.promise()
    }

    /// Transforms a success; failures pass through untouched.
    ///
    /// ```
    /// use deferred_promise::Runtime;
    ///
    /// let runtime = Runtime::new();
    /// let four = runtime
    ///     .resolved(1)
    ///     .then(|v| Ok(v + 1))
    ///     .then(|v| Ok(v + 1))
    ///     .then(|v| Ok(v + 1));
    /// assert_eq!(four.wait().unwrap(), 4);
    /// ```
    pub fn then<U, F>(&self, on_success: F) -> Promise<U>
    where
        U: Value,
        F: FnOnce(V) -> Outcome<U> + Send + 'static,
    {
        self.chain(move |outcome, downstream| {
            downstream.offer(outcome.and_then(|value| guarded(|| on_success(value))));
        })
    }

    /// Like [`then`](Self::then), with a chance to recover from failure.
    pub fn then_or_else<U, S, F>(&self, on_success: S, on_failure: F) -> Promise<U>
    where
        U: Value,
        S: FnOnce(V) -> Outcome<U> + Send + 'static,
        F: FnOnce(Cause) -> Outcome<U> + Send + 'static,
    {
        self.chain(move |outcome, downstream| {
            downstream.offer(match outcome {
                Ok(value) => guarded(|| on_success(value)),
                Err(cause) => guarded(|| on_failure(cause)),
            });
        })
    }

    /// The handler returns another promise; the result settles with whatever
    /// that promise settles with.
    pub fn then_promise<U, F>(&self, on_success: F) -> Promise<U>
    where
        U: Value,
        F: FnOnce(V) -> Outcome<Promise<U>> + Send + 'static,
    {
        self.chain(move |outcome, downstream| {
            match outcome.and_then(|value| guarded(|| on_success(value))) {
                Ok(inner) => forward(&inner, downstream),
                Err(cause) => {
                    downstream.offer(Err(cause));
                }
            }
        })
    }

    /// The handler gets the downstream deferred and settles it itself, now or
    /// later. Returning `Err` fails it right away.
    pub fn then_defer<U, F>(&self, on_success: F) -> Promise<U>
    where
        U: Value,
        F: FnOnce(V, Deferred<U>) -> Result<(), Cause> + Send + 'static,
    {
        self.chain(move |outcome, downstream: &Deferred<U>| {
            let result = outcome.and_then(|value| {
                let target = downstream.clone();
                guarded(|| on_success(value, target))
            });
            if let Err(cause) = result {
                downstream.offer(Err(cause));
            }
        })
    }

    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Value,
        F: FnOnce(V) -> U + Send + 'static,
    {
        self.then(move |value| Ok(f(value)))
    }

    /// Runs a side effect on success and passes the value on.
    pub fn inspect<F>(&self, f: F) -> Promise<V>
    where
        F: FnOnce(&V) + Send + 'static,
    {
        self.then(move |value| {
            f(&value);
            Ok(value)
        })
    }

    /// Recovers from any failure.
    pub fn catch<F>(&self, on_failure: F) -> Promise<V>
    where
        F: FnOnce(Cause) -> Outcome<V> + Send + 'static,
    {
        self.catch_when(&[], on_failure)
    }

    /// Recovers only from causes matching one of `filters`; anything else
    /// passes through. No filters means every cause matches.
    ///
    /// ```
    /// use deferred_promise::{caused_by, Cause, Runtime};
    /// use std::io;
    ///
    /// let runtime = Runtime::new();
    /// let recovered = runtime
    ///     .rejected::<u32>(io::Error::new(io::ErrorKind::Other, "disk"))
    ///     .catch_when(&[caused_by::<io::Error>], |_| Ok(0));
    /// assert_eq!(recovered.wait().unwrap(), 0);
    ///
    /// let passed = runtime
    ///     .rejected::<u32>(Cause::msg("not io"))
    ///     .catch_when(&[caused_by::<io::Error>], |_| Ok(0));
    /// assert!(passed.wait().is_err());
    /// ```
    pub fn catch_when<F>(&self, filters: &[CauseFilter], on_failure: F) -> Promise<V>
    where
        F: FnOnce(Cause) -> Outcome<V> + Send + 'static,
    {
        let filters = filters.to_vec();
        self.chain(move |outcome, downstream| {
            downstream.offer(match outcome {
                Err(cause) if cause.matches(&filters) => guarded(|| on_failure(cause)),
                passthrough => passthrough,
            });
        })
    }

    pub fn catch_promise<F>(&self, on_failure: F) -> Promise<V>
    where
        F: FnOnce(Cause) -> Outcome<Promise<V>> + Send + 'static,
    {
        self.chain(move |outcome, downstream| match outcome {
            Ok(value) => {
                downstream.offer(Ok(value));
            }
            Err(cause) => match guarded(|| on_failure(cause)) {
                Ok(inner) => forward(&inner, downstream),
                Err(cause) => {
                    downstream.offer(Err(cause));
                }
            },
        })
    }
}

impl<U: Value> Promise<Promise<U>> {
    pub fn flatten(&self) -> Promise<U> {
        self.then_promise(Ok)
    }
}

fn forward<U: Value>(inner: &Promise<U>, downstream: &Deferred<U>) {
    if let Err(error) = downstream.bind(inner) {
        downstream.offer(Err(error.into()));
    }
}

/// Listener registrations a combinator drops once it has its answer.
struct Registrations<V> {
    entries: Mutex<Vec<(WeakPromise<V>, ListenerId)>>,
}

impl<V: Value> Registrations<V> {
    fn new() -> Arc<Self> {
        Arc::new(Registrations {
            entries: Mutex::new(Vec::new()),
        })
    }

    fn push(&self, promise: &Promise<V>, id: ListenerId) {
        self.entries.lock().push((promise.downgrade(), id));
    }

    fn detach(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        tracing::debug!(siblings = entries.len(), "detaching combinator listeners");
        for (promise, id) in entries {
            promise.unlisten(id);
        }
    }
}

struct Gathered<V> {
    values: Vec<Option<V>>,
    remaining: usize,
}

impl Runtime {
    /// Succeeds with every value, in input order, once all inputs succeed.
    /// The first failure wins and the remaining inputs are no longer watched.
    pub fn all<V: Value>(&self, promises: &[Promise<V>]) -> Promise<Vec<V>> {
        let deferred = self.defer::<Vec<V>>();
        if promises.is_empty() {
            let _ = deferred.success(Vec::new());
            return deferred.promise();
        }
        deferred.pending();
        let gathered = Arc::new(Mutex::new(Gathered {
            values: vec![None; promises.len()],
            remaining: promises.len(),
        }));
        let registrations = Registrations::new();
        for (index, promise) in promises.iter().enumerate() {
            let target = deferred.clone();
            let gathered = gathered.clone();
            let siblings = registrations.clone();
            let id = promise.core.listen(
                once(move |outcome: &Outcome<V>| match outcome {
                    Ok(value) => {
                        let complete = {
                            let mut gathered = gathered.lock();
                            gathered.values[index] = Some(value.clone());
                            gathered.remaining -= 1;
                            (gathered.remaining == 0)
                                .then(|| gathered.values.drain(..).flatten().collect())
                        };
                        if let Some(values) = complete {
                            target.offer(Ok(values));
                        }
                    }
                    Err(cause) => {
                        if target.offer(Err(cause.clone())) {
                            siblings.detach();
                        }
                    }
                }),
                true,
            );
            registrations.push(promise, id);
            if deferred.is_done() {
                registrations.detach();
                break;
            }
        }
        deferred.promise()
    }

    /// Settles like whichever input settles first, success or failure. An
    /// empty input succeeds with `None`.
    pub fn race<V: Value>(&self, promises: &[Promise<V>]) -> Promise<Option<V>> {
        let deferred = self.defer::<Option<V>>();
        if promises.is_empty() {
            let _ = deferred.success(None);
            return deferred.promise();
        }
        deferred.pending();
        let registrations = Registrations::new();
        for promise in promises {
            let target = deferred.clone();
            let siblings = registrations.clone();
            let id = promise.core.listen(
                once(move |outcome: &Outcome<V>| {
                    if target.offer(outcome.clone().map(Some)) {
                        siblings.detach();
                    }
                }),
                true,
            );
            registrations.push(promise, id);
            if deferred.is_done() {
                registrations.detach();
                break;
            }
        }
        deferred.promise()
    }
}
