//! Completion handles from outside the crate.
//!
//! Foreign results come in a closed set of shapes, [`ExternalHandle`]. Binding
//! one to a deferred blocks an executor thread until the handle finishes, then
//! settles the deferred with its outcome. Going the other way, a [`Promise`]
//! is itself a [`CompletionHandle`] and a `std::future::Future`.
use crate::diagnostics::panic_message;
use crate::settle::{Deferred, Outcome, Promise, Value};
use crate::Error;
use futures::future::BoxFuture;
use std::fmt;
use std::thread::JoinHandle;

/// Anything that can say whether it is done and block until it is.
pub trait CompletionHandle: Send {
    type Output;

    fn is_done(&self) -> bool;

    fn wait(self: Box<Self>) -> Outcome<Self::Output>;
}

impl<V: Value> CompletionHandle for Promise<V> {
    type Output = V;

    fn is_done(&self) -> bool {
        Promise::is_done(self)
    }

    fn wait(self: Box<Self>) -> Outcome<V> {
        Promise::wait(&self)
    }
}

pub enum ExternalHandle<T> {
    Thread(JoinHandle<Outcome<T>>),
    Future(BoxFuture<'static, Outcome<T>>),
    Handle(Box<dyn CompletionHandle<Output = T>>),
}

impl<T> ExternalHandle<T> {
    /// `false` for futures, which can only be found out by running them.
    pub fn is_done(&self) -> bool {
        match self {
            ExternalHandle::Thread(handle) => handle.is_finished(),
            ExternalHandle::Future(_) => false,
            ExternalHandle::Handle(handle) => handle.is_done(),
        }
    }

    /// Blocks the calling thread for the outcome. A panicked thread becomes an
    /// [`Error::Panicked`] rejection.
    pub fn join(self) -> Outcome<T> {
        match self {
            ExternalHandle::Thread(handle) => handle
                .join()
                .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref())).into())),
            ExternalHandle::Future(future) => futures::executor::block_on(future),
            ExternalHandle::Handle(handle) => handle.wait(),
        }
    }
}

impl<V: Value> From<Promise<V>> for ExternalHandle<V> {
    fn from(promise: Promise<V>) -> Self {
        ExternalHandle::Handle(Box::new(promise))
    }
}

impl<T> fmt::Debug for ExternalHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExternalHandle::Thread(_) => "Thread",
            ExternalHandle::Future(_) => "Future",
            ExternalHandle::Handle(_) => "Handle",
        };
        f.debug_tuple("ExternalHandle").field(&kind).finish()
    }
}

/// Settles `deferred` with the outcome of `handle`. A finished handle settles
/// right away; anything else is waited for on the executor.
pub(crate) fn bind<T: Value>(handle: ExternalHandle<T>, deferred: Deferred<T>) {
    if handle.is_done() {
        let _ = deferred.settle(handle.join());
        return;
    }
    deferred.pending();
    tracing::debug!(promise = %deferred.id(), ?handle, "binding external handle");
    let executor = deferred.runtime().executor().clone();
    executor.submit(Box::new(move || {
        let outcome = handle.join();
        if let Err(error) = deferred.settle(outcome) {
            tracing::warn!(%error, "external result discarded");
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::ExternalHandle;
    use crate::{Cause, Error, Runtime};
    use futures::executor::block_on;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_from_thread() {
        let runtime = Runtime::new();
        let handle = thread::spawn(|| {
            thread::sleep(Duration::from_millis(10));
            Ok("🍓")
        });
        assert_eq!(runtime.from_thread(handle).wait().unwrap(), "🍓");
    }

    #[test]
    fn test_panicked_thread_rejects() {
        let runtime = Runtime::new();
        let handle = thread::spawn(|| -> Result<i32, Cause> { panic!("thread died") });
        let cause = runtime.from_thread(handle).wait().unwrap_err();
        assert!(matches!(cause.downcast_ref::<Error>(), Some(Error::Panicked(m)) if m == "thread died"));
    }

    #[test]
    fn test_from_future() {
        let runtime = Runtime::new();
        let promise = runtime.from_future(async { Ok::<_, Cause>(41 + 1) });
        assert_eq!(promise.wait().unwrap(), 42);
    }

    #[test]
    fn test_promise_round_trips_through_handle() {
        let runtime = Runtime::new();
        let deferred = runtime.defer::<i32>();
        let handle = ExternalHandle::from(deferred.promise());
        assert!(!handle.is_done());
        let rebound = runtime.from_external(handle);
        deferred.success(7).unwrap();
        assert_eq!(block_on(rebound).unwrap(), 7);
    }
}
