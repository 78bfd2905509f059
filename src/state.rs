use std::fmt;

/// Lifecycle of a promise.
///
/// States are ordered: a promise only ever moves to a state with a higher
/// ordinal, and the last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PromiseState {
    Waiting,
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl PromiseState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            PromiseState::Succeeded | PromiseState::Failed | PromiseState::Cancelled
        )
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PromiseState::Waiting => "waiting",
            PromiseState::Pending => "pending",
            PromiseState::Succeeded => "succeeded",
            PromiseState::Failed => "failed",
            PromiseState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::PromiseState;

    #[test]
    fn test_state_order() {
        assert!(PromiseState::Waiting < PromiseState::Pending);
        assert!(PromiseState::Pending < PromiseState::Succeeded);
        assert!(PromiseState::Succeeded < PromiseState::Failed);
        assert!(PromiseState::Failed < PromiseState::Cancelled);
    }

    #[test]
    fn test_state_done() {
        assert!(!PromiseState::Waiting.is_done());
        assert!(!PromiseState::Pending.is_done());
        assert!(PromiseState::Succeeded.is_done());
        assert!(PromiseState::Failed.is_done());
        assert!(PromiseState::Cancelled.is_done());
    }
}
