//! External observers for problems that have nowhere else to go.
use crate::Cause;
use std::any::Any;

pub trait Diagnostics: Send + Sync {
    /// A promise failed and was dropped without anyone handling the failure.
    fn unhandled_rejection(&self, promise: &str, cause: &Cause);

    /// A listener of `promise` panicked while being notified.
    fn listener_panicked(&self, promise: &str, message: &str);

    /// A task queued on an ordered dispatcher panicked.
    fn task_panicked(&self, message: &str);

    fn promise_created(&self, _promise: &str) {}
}

/// Default sink: everything goes to `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn unhandled_rejection(&self, promise: &str, cause: &Cause) {
        tracing::error!(promise, cause = %cause, "unhandled promise rejection");
    }

    fn listener_panicked(&self, promise: &str, message: &str) {
        tracing::error!(promise, message, "promise listener panicked");
    }

    fn task_panicked(&self, message: &str) {
        tracing::error!(message, "queued task panicked");
    }

    fn promise_created(&self, promise: &str) {
        tracing::trace!(promise, "promise created");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::panic_message;
    use std::panic;

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");
        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
