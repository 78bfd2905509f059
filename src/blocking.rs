//! A blocking iterator over a push-based [`Publisher`].
//!
//! The bridge asks for exactly one element per blocking fetch, so a producer
//! never runs ahead of the consumer unless [`BlockingIter::preload`] says so.
//! The first terminal signal wins; an error is sticky until the iterator is
//! closed.
use crate::flow::{Publisher, Subscriber, Subscription};
use crate::{Cause, Error};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unsubscribed,
    Subscribed,
    Completed,
    Errored,
    Closed,
}

struct State<T> {
    phase: Phase,
    buffer: VecDeque<T>,
    subscription: Option<Arc<dyn Subscription>>,
    error: Option<Cause>,
    // Requested but not yet received.
    in_flight: u64,
}

struct Bridge<T> {
    state: Mutex<State<T>>,
    signal: Condvar,
    cancel_sent: AtomicBool,
}

impl<T> Bridge<T> {
    fn send_cancel(&self, subscription: &dyn Subscription) {
        if !self.cancel_sent.swap(true, Ordering::AcqRel) {
            tracing::trace!("bridge forwarding cancellation");
            subscription.cancel();
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for Bridge<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut state = self.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Unsubscribed => {
                tracing::trace!("bridge subscribed");
                state.phase = Phase::Subscribed;
                state.subscription = Some(subscription);
                self.signal.notify_all();
            }
            Phase::Closed => {
                drop(state);
                self.send_cancel(subscription.as_ref());
            }
            phase => {
                drop(state);
                tracing::warn!(?phase, "second subscription rejected");
                subscription.cancel();
            }
        }
    }

    fn on_next(&self, item: T) {
        let mut state = self.state.lock();
        if state.phase == Phase::Closed {
            return;
        }
        state.in_flight = state.in_flight.saturating_sub(1);
        state.buffer.push_back(item);
        self.signal.notify_all();
    }

    fn on_error(&self, cause: Cause) {
        let mut state = self.state.lock();
        if state.phase != Phase::Subscribed && state.phase != Phase::Unsubscribed {
            return;
        }
        tracing::trace!(%cause, "bridge errored");
        state.phase = Phase::Errored;
        state.error = Some(cause);
        state.subscription = None;
        self.signal.notify_all();
    }

    fn on_complete(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Subscribed && state.phase != Phase::Unsubscribed {
            return;
        }
        tracing::trace!("bridge completed");
        state.phase = Phase::Completed;
        state.subscription = None;
        self.signal.notify_all();
    }
}

/// Synchronous, demand-driven view of a [`Publisher`].
///
/// ```
/// use deferred_promise::Runtime;
///
/// let runtime = Runtime::new();
/// let numbers = runtime.seq_from_iter(1..=3);
/// let collected: Result<Vec<_>, _> = numbers.iter().collect();
/// assert_eq!(collected.unwrap(), vec![1, 2, 3]);
/// ```
pub struct BlockingIter<T> {
    bridge: Arc<Bridge<T>>,
    fused: bool,
}

impl<T: Send + 'static> BlockingIter<T> {
    pub fn new(publisher: &dyn Publisher<T>) -> Self {
        let bridge = Arc::new(Bridge {
            state: Mutex::new(State {
                phase: Phase::Unsubscribed,
                buffer: VecDeque::new(),
                subscription: None,
                error: None,
                in_flight: 0,
            }),
            signal: Condvar::new(),
            cancel_sent: AtomicBool::new(false),
        });
        publisher.subscribe(bridge.clone());
        BlockingIter {
            bridge,
            fused: false,
        }
    }

    /// Blocks until the publisher has handed over its subscription. `None`
    /// once the iterator is closed or the producer has finished.
    pub fn subscription(&self) -> Option<Arc<dyn Subscription>> {
        let mut state = self.bridge.state.lock();
        while state.phase == Phase::Unsubscribed {
            self.bridge.signal.wait(&mut state);
        }
        state.subscription.clone()
    }

    /// Requests `n` elements up front instead of one per fetch.
    pub fn preload(&self, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(subscription) = self.subscription() {
            self.bridge.state.lock().in_flight += n;
            subscription.request(n);
        }
    }

    /// Blocks until an element is buffered or the stream has ended.
    pub fn has_next(&self) -> Result<bool, Error> {
        let mut state = self.bridge.state.lock();
        loop {
            if !state.buffer.is_empty() {
                return Ok(true);
            }
            let phase = state.phase;
            match phase {
                Phase::Completed | Phase::Closed => return Ok(false),
                Phase::Errored => {
                    let cause = state.error.clone().unwrap_or_else(|| Error::Closed.into());
                    return Err(Error::Rejected(cause));
                }
                Phase::Unsubscribed => self.bridge.signal.wait(&mut state),
                Phase::Subscribed if state.in_flight > 0 => self.bridge.signal.wait(&mut state),
                Phase::Subscribed => {
                    let Some(subscription) = state.subscription.clone() else {
                        return Ok(false);
                    };
                    state.in_flight += 1;
                    tracing::trace!("bridge fetching one element");
                    // The publisher may answer on this thread.
                    MutexGuard::unlocked(&mut state, || subscription.request(1));
                }
            }
        }
    }

    /// The next element, blocking for it if needed.
    pub fn next_element(&self) -> Result<T, Error> {
        if !self.has_next()? {
            return Err(if self.is_closed() {
                Error::Closed
            } else {
                Error::NoSuchElement
            });
        }
        self.bridge
            .state
            .lock()
            .buffer
            .pop_front()
            .ok_or(Error::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.bridge.state.lock().phase == Phase::Closed
    }

    /// Stops the iteration: drops buffered elements, wakes a blocked fetch and
    /// cancels the producer once. Idempotent.
    pub fn close(&self) {
        let subscription = {
            let mut state = self.bridge.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.buffer.clear();
            self.bridge.signal.notify_all();
            state.subscription.take()
        };
        tracing::trace!("bridge closed");
        if let Some(subscription) = subscription {
            self.bridge.send_cancel(subscription.as_ref());
        }
    }
}

impl<T: Send + 'static> Iterator for BlockingIter<T> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.next_element() {
            Ok(item) => Some(Ok(item)),
            Err(Error::NoSuchElement | Error::Closed) => {
                self.fused = true;
                None
            }
            Err(error) => {
                self.fused = true;
                Some(Err(error))
            }
        }
    }
}

impl<T> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        let subscription = {
            let mut state = self.bridge.state.lock();
            state.phase = Phase::Closed;
            state.buffer.clear();
            state.subscription.take()
        };
        if let Some(subscription) = subscription {
            self.bridge.send_cancel(subscription.as_ref());
        }
    }
}

impl<T> fmt::Debug for BlockingIter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.bridge.state.lock();
        f.debug_struct("BlockingIter")
            .field("phase", &state.phase)
            .field("buffered", &state.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::BlockingIter;
    use crate::executor::Inline;
    use crate::{Cause, Error, Runtime};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_iterates_a_completed_sequence() {
        let runtime = Runtime::builder().executor(Arc::new(Inline)).build();
        let seq = runtime.seq_from_iter(vec!["🍓", "🍇"]);
        let mut iter = seq.iter();
        assert_eq!(iter.next_element().unwrap(), "🍓");
        assert!(iter.has_next().unwrap());
        assert_eq!(iter.next().unwrap().unwrap(), "🍇");
        assert!(!iter.has_next().unwrap());
        assert!(matches!(iter.next_element(), Err(Error::NoSuchElement)));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_error_is_sticky() {
        let runtime = Runtime::builder().executor(Arc::new(Inline)).build();
        let seq = runtime.defer_seq::<i32>();
        seq.next(1).unwrap();
        seq.failure(Cause::msg("broken")).unwrap();
        let iter = seq.promise().iter();
        assert_eq!(iter.next_element().unwrap(), 1);
        for _ in 0..3 {
            assert!(matches!(iter.has_next(), Err(Error::Rejected(c)) if c.to_string() == "broken"));
        }
        iter.close();
        assert!(!iter.has_next().unwrap());
        assert!(matches!(iter.next_element(), Err(Error::Closed)));
    }

    #[test]
    fn test_close_wakes_blocked_fetch() {
        let runtime = Runtime::new();
        let seq = runtime.defer_seq::<i32>();
        let iter = Arc::new(seq.promise().iter());
        let fetcher = {
            let iter = iter.clone();
            thread::spawn(move || iter.has_next())
        };
        thread::sleep(Duration::from_millis(50));
        iter.close();
        assert!(!fetcher.join().unwrap().unwrap());
        assert!(iter.is_closed());
    }

    #[test]
    fn test_iterator_yields_error_once() {
        let runtime = Runtime::builder().executor(Arc::new(Inline)).build();
        let seq = runtime.defer_seq::<i32>();
        seq.failure(Cause::msg("nothing")).unwrap();
        let results: Vec<_> = BlockingIter::new(&seq.promise()).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
