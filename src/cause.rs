//! Rejection causes.
//!
//! A [`Cause`] is the structured value a failed promise carries. Every
//! listener of a promise sees the same cause, so it is a cheap, cloneable
//! handle around an [`anyhow::Error`]. Any `std::error::Error` converts into a
//! cause with `?`; anything else that is merely printable goes through
//! [`Cause::msg`].
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

#[derive(Clone)]
pub struct Cause {
    inner: Arc<anyhow::Error>,
}

/// Predicate deciding whether a `catch_when` handler is engaged for a cause.
pub type CauseFilter = fn(&Cause) -> bool;

impl Cause {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Cause {
            inner: Arc::new(anyhow::Error::new(error)),
        }
    }

    /// Wraps a value that is not an error type, such as a string.
    pub fn msg<M>(message: M) -> Self
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        Cause {
            inner: Arc::new(anyhow::Error::msg(message)),
        }
    }

    pub fn from_anyhow(error: anyhow::Error) -> Self {
        Cause {
            inner: Arc::new(error),
        }
    }

    /// True if `E` is this cause or appears anywhere in its source chain.
    pub fn is<E>(&self) -> bool
    where
        E: StdError + Send + Sync + 'static,
    {
        self.downcast_ref::<E>().is_some()
    }

    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.inner
            .downcast_ref::<E>()
            .or_else(|| self.inner.chain().find_map(|e| e.downcast_ref::<E>()))
    }

    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        self.inner.root_cause()
    }

    pub fn chain(&self) -> anyhow::Chain<'_> {
        self.inner.chain()
    }

    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn matches(&self, filters: &[CauseFilter]) -> bool {
        filters.is_empty() || filters.iter().any(|filter| filter(self))
    }
}

/// Cause filter matching any cause whose chain contains an `E`.
///
/// ```
/// use deferred_promise::{caused_by, Cause, CauseFilter};
/// let filters: &[CauseFilter] = &[caused_by::<std::io::Error>];
/// let cause = Cause::new(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
/// assert!(cause.matches(filters));
/// ```
pub fn caused_by<E>(cause: &Cause) -> bool
where
    E: StdError + Send + Sync + 'static,
{
    cause.is::<E>()
}

impl<E> From<E> for Cause
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Cause::new(error)
    }
}

impl Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}
