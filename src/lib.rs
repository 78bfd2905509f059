//! Deferred/promise pairs for threaded code.
//!
//! A [`Deferred`] is the writing half of a promise and a [`Promise`] the
//! shared, read-only half. Listeners registered on a promise run exactly once,
//! in registration order, on the runtime's executor; combinators such as
//! [`Promise::then`], [`Runtime::all`] and [`Runtime::race`] build new
//! promises wired to existing ones. [`PromiseSeq`] extends the idea to an
//! append-only sequence that can be consumed through a demand-driven
//! [`Publisher`], and [`BlockingIter`] turns any such publisher into a plain
//! blocking iterator.
//!
//! # Examples
//!
//! ```
//! use deferred_promise::Runtime;
//!
//! let runtime = Runtime::new();
//! let answer = runtime
//!     .spawn(|| Ok(20))
//!     .then(|v| Ok(v + 1))
//!     .map(|v| v * 2);
//! assert_eq!(answer.wait().unwrap(), 42);
//! ```
use std::time::Duration;

pub mod blocking;
pub mod capability;
pub mod cause;
mod combinators;
pub mod diagnostics;
pub mod dispatcher;
pub mod executor;
pub mod external;
pub mod flow;
pub mod runtime;
pub mod sequence;
mod settle;
pub mod state;
pub mod timer;

pub use crate::blocking::BlockingIter;
pub use crate::capability::{Awaitable, Cancellable, Streamable, Thenable};
pub use crate::cause::{caused_by, Cause, CauseFilter};
pub use crate::diagnostics::{Diagnostics, TracingDiagnostics};
pub use crate::dispatcher::OrderedDispatcher;
pub use crate::executor::{CachedPool, Executor, Inline, Task};
pub use crate::external::{CompletionHandle, ExternalHandle};
pub use crate::flow::{Demand, Publisher, Subscriber, Subscription};
pub use crate::runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use crate::sequence::{DeferredSeq, PromiseSeq, Snapshot};
pub use crate::settle::{Deferred, ListenerId, Outcome, Progress, Promise, Value};
pub use crate::state::PromiseState;
pub use crate::timer::{Periodic, ThreadTimer, TimerHandle, TimerService};

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("promise [{promise}] already {state}, cannot settle it again")]
    AlreadySettled { promise: String, state: PromiseState },
    #[error("timed out after {0:?} waiting for promise")]
    Timeout(Duration),
    #[error("promise cancelled")]
    Cancelled,
    #[error("every deferred handle was dropped before the promise settled")]
    DeferredDropped,
    #[error("promise rejected: {0}")]
    Rejected(Cause),
    #[error("iterator closed")]
    Closed,
    #[error("no more elements")]
    NoSuchElement,
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("a deferred cannot be bound to its own promise")]
    SelfBinding,
}
