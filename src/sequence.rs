//! Append-only sequences whose completion is itself a promise.
//!
//! A [`DeferredSeq`] accepts elements with [`next`](DeferredSeq::next) until
//! it is completed or failed. Its [`PromiseSeq`] is a
//! `Promise<Snapshot<E>>` (it derefs to one) that also serves the elements to
//! subscribers: a subscriber joining late first receives everything appended
//! so far, oldest first, and then new elements as they arrive, never more than
//! it has requested.
use crate::blocking::BlockingIter;
use crate::diagnostics::{panic_message, Diagnostics};
use crate::dispatcher::OrderedDispatcher;
use crate::flow::{Demand, Publisher, Subscriber, Subscription};
use crate::runtime::Runtime;
use crate::settle::{guarded, once, Deferred, ListenerId, Outcome, Promise, Value, WeakPromise};
use crate::{Cause, Error, PromiseState};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// The immutable, ordered contents of a completed sequence.
pub type Snapshot<E> = Arc<Vec<E>>;

type ElementListener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Elements<E> {
    items: Snapshot<E>,
    listeners: Arc<Vec<(ListenerId, ElementListener<E>)>>,
    closed: bool,
}

struct SeqCore<E> {
    // Held across append-and-notify so every listener sees elements in
    // append order, and a new listener's replay cannot interleave with an
    // append. Element listeners must not append to their own sequence.
    emit: Mutex<()>,
    elements: Mutex<Elements<E>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl<E: Value> SeqCore<E> {
    fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        SeqCore {
            emit: Mutex::new(()),
            elements: Mutex::new(Elements {
                items: Arc::new(Vec::new()),
                listeners: Arc::default(),
                closed: false,
            }),
            diagnostics,
        }
    }

    fn notify(&self, promise: &str, listener: &ElementListener<E>, item: &E) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(item))) {
            self.diagnostics
                .listener_panicked(promise, &panic_message(payload.as_ref()));
        }
    }

    /// Replays the current elements to `listener`, then keeps it informed.
    fn add_listener(&self, promise: &str, listener: ElementListener<E>) -> ListenerId {
        let id = ListenerId::next();
        let _emit = self.emit.lock();
        let replay = {
            let mut elements = self.elements.lock();
            if !elements.closed {
                Arc::make_mut(&mut elements.listeners).push((id, listener.clone()));
            }
            elements.items.clone()
        };
        for item in replay.iter() {
            self.notify(promise, &listener, item);
        }
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut elements = self.elements.lock();
        if !elements.listeners.iter().any(|(registered, _)| *registered == id) {
            return false;
        }
        Arc::make_mut(&mut elements.listeners).retain(|(registered, _)| *registered != id);
        true
    }

    fn close(&self) -> Snapshot<E> {
        let mut elements = self.elements.lock();
        elements.closed = true;
        elements.listeners = Arc::default();
        elements.items.clone()
    }

    fn snapshot(&self) -> Snapshot<E> {
        self.elements.lock().items.clone()
    }
}

/// The write side of a sequence.
pub struct DeferredSeq<E: Value> {
    deferred: Deferred<Snapshot<E>>,
    seq: Arc<SeqCore<E>>,
}

impl<E: Value> Clone for DeferredSeq<E> {
    fn clone(&self) -> Self {
        DeferredSeq {
            deferred: self.deferred.clone(),
            seq: self.seq.clone(),
        }
    }
}

impl<E: Value> DeferredSeq<E> {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        let deferred = runtime.defer::<Snapshot<E>>();
        let seq = Arc::new(SeqCore::new(runtime.diagnostics()));
        // Settling by any route, including a cancel handler, releases the
        // element listeners. This does not count as handling a failure.
        let released = Arc::downgrade(&seq);
        deferred.promise().core.listen(
            once(move |_: &Outcome<Snapshot<E>>| {
                if let Some(seq) = released.upgrade() {
                    seq.close();
                }
            }),
            false,
        );
        DeferredSeq { deferred, seq }
    }

    pub fn promise(&self) -> PromiseSeq<E> {
        PromiseSeq {
            promise: self.deferred.promise(),
            seq: self.seq.clone(),
        }
    }

    pub fn id(&self) -> Arc<str> {
        self.deferred.id()
    }

    pub fn identify(self, name: &str) -> Self {
        DeferredSeq {
            deferred: self.deferred.identify(name),
            seq: self.seq,
        }
    }

    pub fn state(&self) -> PromiseState {
        self.deferred.state()
    }

    pub fn is_done(&self) -> bool {
        self.deferred.is_done()
    }

    pub fn pending(&self) -> &Self {
        self.deferred.pending();
        self
    }

    pub fn on_cancel<F>(&self, handler: F) -> &Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.deferred.on_cancel(handler);
        self
    }

    pub fn progress<P>(&self, progress: P) -> Result<(), Error>
    where
        P: Any + Send + Sync,
    {
        self.deferred.progress(progress)
    }

    /// Appends `item` and hands it to every element listener before
    /// returning.
    pub fn next(&self, item: E) -> Result<(), Error> {
        let _emit = self.seq.emit.lock();
        let listeners = {
            let mut elements = self.seq.elements.lock();
            let state = self.deferred.state();
            if elements.closed || state.is_done() {
                let promise = self.id().to_string();
                tracing::warn!(%promise, %state, "element appended to a settled sequence");
                return Err(Error::AlreadySettled { promise, state });
            }
            Arc::make_mut(&mut elements.items).push(item.clone());
            elements.listeners.clone()
        };
        self.deferred.pending();
        let id = self.id();
        for (_, listener) in listeners.iter() {
            self.seq.notify(&id, listener, &item);
        }
        Ok(())
    }

    pub fn extend<I>(&self, items: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = E>,
    {
        items.into_iter().try_for_each(|item| self.next(item))
    }

    /// Succeeds with a snapshot of everything appended.
    pub fn complete(&self) -> Result<(), Error> {
        let _emit = self.seq.emit.lock();
        let snapshot = self.seq.close();
        tracing::trace!(promise = %self.id(), elements = snapshot.len(), "sequence complete");
        self.deferred.success(snapshot)
    }

    pub fn failure(&self, cause: impl Into<Cause>) -> Result<(), Error> {
        let _emit = self.seq.emit.lock();
        self.seq.close();
        self.deferred.failure(cause)
    }

    pub fn cancel(&self) -> Result<(), Error> {
        let _emit = self.seq.emit.lock();
        self.seq.close();
        self.deferred.cancel()
    }

    pub fn elements_now(&self) -> Snapshot<E> {
        self.seq.snapshot()
    }
}

impl<E: Value> fmt::Debug for DeferredSeq<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSeq")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("elements", &self.seq.snapshot().len())
            .finish()
    }
}

/// The read side of a sequence.
pub struct PromiseSeq<E: Value> {
    promise: Promise<Snapshot<E>>,
    seq: Arc<SeqCore<E>>,
}

impl<E: Value> Clone for PromiseSeq<E> {
    fn clone(&self) -> Self {
        PromiseSeq {
            promise: self.promise.clone(),
            seq: self.seq.clone(),
        }
    }
}

impl<E: Value> Deref for PromiseSeq<E> {
    type Target = Promise<Snapshot<E>>;

    fn deref(&self) -> &Self::Target {
        &self.promise
    }
}

impl<E: Value> fmt::Debug for PromiseSeq<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseSeq")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("elements", &self.seq.snapshot().len())
            .finish()
    }
}

impl<E: Value> PromiseSeq<E> {
    pub fn promise(&self) -> Promise<Snapshot<E>> {
        self.promise.clone()
    }

    /// Calls `f` for every element, past and future, on the appending thread.
    ///
    /// `f` must not append to this sequence; the append lock is held while it
    /// runs.
    pub fn on_every<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.seq.add_listener(&self.id(), Arc::new(f))
    }

    /// Like [`on_every`](Self::on_every) but `f` runs on the executor, one
    /// element at a time and in order.
    pub fn on_every_async<F>(&self, f: F) -> ListenerId
    where
        F: Fn(E) + Send + Sync + 'static,
    {
        let dispatcher = self.runtime().dispatcher();
        let f = Arc::new(f);
        self.on_every(move |item: &E| {
            let f = f.clone();
            let item = item.clone();
            dispatcher.submit(move || f(item));
        })
    }

    pub fn remove_element_listener(&self, id: ListenerId) -> bool {
        self.seq.remove_listener(id)
    }

    /// A derived sequence holding `f` of each element. It completes or fails
    /// with this one. If `f` panics the derived sequence fails with
    /// [`Error::Panicked`] and stops following this one.
    pub fn map<U, F>(&self, f: F) -> PromiseSeq<U>
    where
        U: Value,
        F: Fn(&E) -> U + Send + Sync + 'static,
    {
        let mapped = self.runtime().defer_seq::<U>();
        if self.state() == PromiseState::Pending {
            mapped.pending();
        }
        let registration = Arc::new(Mutex::new(None::<ListenerId>));
        let slot = registration.clone();
        let source = Arc::downgrade(&self.seq);
        let sink = mapped.clone();
        let id = self.on_every(move |item: &E| {
            if sink.is_done() {
                return;
            }
            match guarded(|| Ok(f(item))) {
                Ok(value) => {
                    let _ = sink.next(value);
                }
                Err(cause) => {
                    let _ = sink.failure(cause);
                    let id = *slot.lock();
                    if let (Some(source), Some(id)) = (source.upgrade(), id) {
                        source.remove_listener(id);
                    }
                }
            }
        });
        *registration.lock() = Some(id);
        if mapped.is_done() {
            self.seq.remove_listener(id);
        }
        let sink = mapped.clone();
        self.promise.on_done(move |outcome: &Outcome<Snapshot<E>>| {
            if sink.is_done() {
                return;
            }
            let _ = match outcome {
                Ok(_) => sink.complete(),
                Err(cause) => sink.failure(cause.clone()),
            };
        });
        mapped.promise()
    }

    /// Blocks until complete, then returns the first element.
    pub fn first(&self) -> Result<E, Error> {
        let snapshot = self.promise.wait().map_err(Error::Rejected)?;
        snapshot.first().cloned().ok_or(Error::NoSuchElement)
    }

    pub fn last(&self) -> Result<E, Error> {
        let snapshot = self.promise.wait().map_err(Error::Rejected)?;
        snapshot.last().cloned().ok_or(Error::NoSuchElement)
    }

    pub fn count(&self) -> Result<usize, Error> {
        let snapshot = self.promise.wait().map_err(Error::Rejected)?;
        Ok(snapshot.len())
    }

    /// Everything appended so far. Still available after a failure.
    pub fn elements_now(&self) -> Snapshot<E> {
        self.seq.snapshot()
    }

    /// A blocking iterator pulling one element at a time.
    pub fn iter(&self) -> BlockingIter<E> {
        BlockingIter::new(self)
    }
}

impl<E: Value> Publisher<E> for PromiseSeq<E> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<E>>) {
        let subscription = Arc::new_cyclic(|me| SeqSubscription {
            me: me.clone(),
            promise: self.id(),
            subscriber: Mutex::new(Some(subscriber)),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                terminal: None,
                finished: false,
            }),
            dispatcher: self.runtime().dispatcher(),
            source: Arc::downgrade(&self.seq),
            registrations: Mutex::new(Registrations::default()),
        });
        subscription.start(self);
    }
}

struct Queue<E> {
    items: VecDeque<E>,
    terminal: Option<Option<Cause>>,
    finished: bool,
}

struct Registrations<E> {
    elements: Option<ListenerId>,
    done: Option<(WeakPromise<Snapshot<E>>, ListenerId)>,
}

impl<E> Default for Registrations<E> {
    fn default() -> Self {
        Registrations {
            elements: None,
            done: None,
        }
    }
}

enum Step<E> {
    Next(E),
    Done(Option<Cause>),
}

/// One subscriber's view of a sequence. Every signal to the subscriber goes
/// through `dispatcher`, so they arrive in order and never concurrently.
struct SeqSubscription<E: Value> {
    me: Weak<SeqSubscription<E>>,
    promise: Arc<str>,
    subscriber: Mutex<Option<Arc<dyn Subscriber<E>>>>,
    demand: Demand,
    cancelled: AtomicBool,
    // TODO: bound this buffer. A subscriber that never requests keeps every
    // element appended after it subscribed alive here.
    queue: Mutex<Queue<E>>,
    dispatcher: OrderedDispatcher,
    source: Weak<SeqCore<E>>,
    registrations: Mutex<Registrations<E>>,
}

impl<E: Value> SeqSubscription<E> {
    fn start(self: &Arc<Self>, seq: &PromiseSeq<E>) {
        tracing::debug!(promise = %self.promise, "subscriber attached");
        let subscription = self.clone();
        self.dispatcher.submit(move || {
            if let Some(subscriber) = subscription.subscriber() {
                let handle: Arc<dyn Subscription> = subscription.clone();
                subscriber.on_subscribe(handle);
            }
        });

        let sink = self.clone();
        let elements = seq
            .seq
            .add_listener(&self.promise, Arc::new(move |item: &E| sink.push(item.clone())));
        let sink = self.clone();
        let done = seq.promise.on_done(move |outcome: &Outcome<Snapshot<E>>| {
            sink.finish(outcome.as_ref().err().cloned())
        });
        *self.registrations.lock() = Registrations {
            elements: Some(elements),
            done: Some((seq.promise.downgrade(), done)),
        };
        if self.cancelled.load(Ordering::Acquire) {
            self.release();
        }
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<E>>> {
        self.subscriber.lock().clone()
    }

    fn push(self: &Arc<Self>, item: E) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.queue.lock().items.push_back(item);
        self.schedule_drain();
    }

    fn finish(self: &Arc<Self>, cause: Option<Cause>) {
        self.queue.lock().terminal = Some(cause);
        self.schedule_drain();
    }

    fn schedule_drain(self: &Arc<Self>) {
        let subscription = self.clone();
        self.dispatcher.submit(move || subscription.drain());
    }

    fn drain(&self) {
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let step = {
                let mut queue = self.queue.lock();
                if queue.finished {
                    return;
                }
                if !queue.items.is_empty() {
                    if !self.demand.try_consume() {
                        return;
                    }
                    match queue.items.pop_front() {
                        Some(item) => Step::Next(item),
                        None => return,
                    }
                } else if let Some(terminal) = queue.terminal.take() {
                    queue.finished = true;
                    Step::Done(terminal)
                } else {
                    return;
                }
            };
            let Some(subscriber) = self.subscriber() else {
                return;
            };
            match step {
                Step::Next(item) => subscriber.on_next(item),
                Step::Done(None) => {
                    self.release();
                    subscriber.on_complete();
                }
                Step::Done(Some(cause)) => {
                    self.release();
                    subscriber.on_error(cause);
                }
            }
        }
    }

    /// Drops the subscriber and every listener this subscription installed.
    fn release(&self) {
        self.subscriber.lock().take();
        let registrations = std::mem::take(&mut *self.registrations.lock());
        if let (Some(id), Some(source)) = (registrations.elements, self.source.upgrade()) {
            source.remove_listener(id);
        }
        if let Some((promise, id)) = registrations.done {
            promise.unlisten(id);
        }
    }
}

impl<E: Value> Subscription for SeqSubscription<E> {
    fn request(&self, n: u64) {
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let requested = self.demand.grant(n);
        tracing::trace!(promise = %self.promise, n, requested, "demand granted");
        if let Some(subscription) = self.me.upgrade() {
            subscription.schedule_drain();
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(promise = %self.promise, "subscription cancelled");
        self.queue.lock().items.clear();
        self.release();
    }
}

/// Collects a publisher into a new sequence, one element of demand at a time.
pub(crate) fn collect<E: Value>(runtime: &Runtime, publisher: &dyn Publisher<E>) -> PromiseSeq<E> {
    let sink = runtime.defer_seq::<E>();
    let slot: Arc<Mutex<Option<Arc<dyn Subscription>>>> = Arc::default();
    let cancel_slot = slot.clone();
    sink.on_cancel(move || {
        if let Some(subscription) = cancel_slot.lock().take() {
            subscription.cancel();
        }
        true
    });
    let promise = sink.promise();
    publisher.subscribe(Arc::new(Collector { sink, slot }));
    promise
}

struct Collector<E: Value> {
    sink: DeferredSeq<E>,
    slot: Arc<Mutex<Option<Arc<dyn Subscription>>>>,
}

impl<E: Value> Collector<E> {
    fn request_one(&self) {
        let subscription = self.slot.lock().clone();
        if let Some(subscription) = subscription {
            subscription.request(1);
        }
    }
}

impl<E: Value> Subscriber<E> for Collector<E> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.sink.is_done() {
            subscription.cancel();
            return;
        }
        *self.slot.lock() = Some(subscription);
        self.sink.pending();
        self.request_one();
    }

    fn on_next(&self, item: E) {
        if self.sink.next(item).is_ok() {
            self.request_one();
        }
    }

    fn on_error(&self, cause: Cause) {
        self.slot.lock().take();
        let _ = self.sink.failure(cause);
    }

    fn on_complete(&self) {
        self.slot.lock().take();
        let _ = self.sink.complete();
    }
}
