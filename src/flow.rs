//! The credit-based push protocol shared by sequences and blocking iterators.
//!
//! A [`Publisher`] hands each subscriber a [`Subscription`] and then emits at
//! most as many elements as the subscriber has requested. Demand is a running
//! total; requesting `u64::MAX` in total means "unbounded". Cancelling is
//! terminal for the producer.
use crate::Cause;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub trait Subscription: Send + Sync {
    /// Grants `n` more elements of demand. Zero is ignored.
    fn request(&self, n: u64);

    fn cancel(&self);
}

pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, item: T);

    fn on_error(&self, cause: Cause);

    fn on_complete(&self);
}

pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Requested and delivered counters for one subscription.
///
/// Both only grow. An element may be sent while `delivered < requested`; the
/// requested side saturates at `u64::MAX`, which never runs out.
#[derive(Debug, Default)]
pub struct Demand {
    requested: AtomicU64,
    delivered: AtomicU64,
}

impl Demand {
    pub fn new() -> Self {
        Demand::default()
    }

    /// Adds `n` to the requested total, saturating. Returns the new total.
    pub fn grant(&self, n: u64) -> u64 {
        let previous = self
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |requested| {
                Some(requested.saturating_add(n))
            })
            .unwrap_or_else(|current| current);
        previous.saturating_add(n)
    }

    /// Claims one unit of demand for a delivery. `false` if none is left.
    pub fn try_consume(&self) -> bool {
        self.delivered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |delivered| {
                let requested = self.requested.load(Ordering::Acquire);
                (requested == u64::MAX || delivered < requested).then(|| delivered + 1)
            })
            .is_ok()
    }

    pub fn outstanding(&self) -> u64 {
        let requested = self.requested.load(Ordering::Acquire);
        if requested == u64::MAX {
            return u64::MAX;
        }
        requested.saturating_sub(self.delivered.load(Ordering::Acquire))
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}
