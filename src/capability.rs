//! Capabilities shared by the promise-like types, for code that only needs one
//! of them.
use crate::blocking::BlockingIter;
use crate::sequence::{PromiseSeq, Snapshot};
use crate::settle::{once, ListenerId, Outcome, Promise, Value};
use crate::Error;
use std::time::Duration;

pub trait Awaitable {
    type Output;

    fn wait(&self) -> Outcome<Self::Output>;

    fn await_timeout(&self, timeout: Duration) -> Result<(), Error>;

    fn is_done(&self) -> bool;
}

pub trait Thenable {
    type Output;

    /// Runs `f` once with the outcome. Counts as handling a failure.
    fn listen<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(&Outcome<Self::Output>) + Send + 'static;

    fn unlisten(&self, id: ListenerId) -> bool;
}

pub trait Cancellable {
    /// Asks the producer to stop. `true` if the request was accepted.
    fn cancel(&self) -> bool;
}

pub trait Streamable {
    type Item;

    fn iter(&self) -> BlockingIter<Self::Item>;
}

impl<V: Value> Awaitable for Promise<V> {
    type Output = V;

    fn wait(&self) -> Outcome<V> {
        Promise::wait(self)
    }

    fn await_timeout(&self, timeout: Duration) -> Result<(), Error> {
        Promise::await_timeout(self, timeout).map(|_| ())
    }

    fn is_done(&self) -> bool {
        Promise::is_done(self)
    }
}

impl<V: Value> Thenable for Promise<V> {
    type Output = V;

    fn listen<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(&Outcome<V>) + Send + 'static,
    {
        self.core.listen(once(f), true)
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.core.unlisten(id)
    }
}

impl<V: Value> Cancellable for Promise<V> {
    fn cancel(&self) -> bool {
        Promise::cancel(self)
    }
}

impl<E: Value> Awaitable for PromiseSeq<E> {
    type Output = Snapshot<E>;

    fn wait(&self) -> Outcome<Snapshot<E>> {
        Promise::wait(self)
    }

    fn await_timeout(&self, timeout: Duration) -> Result<(), Error> {
        Promise::await_timeout(self, timeout).map(|_| ())
    }

    fn is_done(&self) -> bool {
        Promise::is_done(self)
    }
}

impl<E: Value> Thenable for PromiseSeq<E> {
    type Output = Snapshot<E>;

    fn listen<F>(&self, f: F) -> ListenerId
    where
        F: FnOnce(&Outcome<Snapshot<E>>) + Send + 'static,
    {
        self.core.listen(once(f), true)
    }

    fn unlisten(&self, id: ListenerId) -> bool {
        self.core.unlisten(id)
    }
}

impl<E: Value> Cancellable for PromiseSeq<E> {
    fn cancel(&self) -> bool {
        Promise::cancel(self)
    }
}

impl<E: Value> Streamable for PromiseSeq<E> {
    type Item = E;

    fn iter(&self) -> BlockingIter<E> {
        PromiseSeq::iter(self)
    }
}

impl<T: Send + 'static> Cancellable for BlockingIter<T> {
    fn cancel(&self) -> bool {
        self.close();
        true
    }
}
