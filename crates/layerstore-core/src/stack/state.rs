//! Stack lifecycle state

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::error::InitError;

/// Where a stack is in its one-shot initialization
#[derive(Debug, Clone)]
pub enum StackState {
    /// Constructed, initialization not started
    Uninitialized,
    /// The store is being located and opened
    Opening,
    /// A fresh store is open and the seeder is running
    Seeding,
    /// Usable. `preexisting` tells whether the store file was already there.
    Ready { preexisting: bool },
    /// Initialization failed; the stack will never become ready
    Failed(Arc<InitError>),
}

impl StackState {
    pub fn name(&self) -> &'static str {
        match self {
            StackState::Uninitialized => "uninitialized",
            StackState::Opening => "opening",
            StackState::Seeding => "seeding",
            StackState::Ready { .. } => "ready",
            StackState::Failed(_) => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, StackState::Ready { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StackState::Failed(_))
    }

    /// Ready and Failed are final
    pub fn is_terminal(&self) -> bool {
        self.is_ready() || self.is_failed()
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_advance_to(&self, next: &StackState) -> bool {
        use StackState::*;
        matches!(
            (self, next),
            (Uninitialized, Opening)
                | (Opening, Seeding)
                | (Opening, Ready { .. })
                | (Opening, Failed(_))
                | (Seeding, Ready { .. })
                | (Seeding, Failed(_))
        )
    }
}

/// Apply `next` if it is a legal transition from the current state
///
/// Returns whether the state changed. Illegal moves are logged and dropped.
pub(crate) fn advance(tx: &watch::Sender<StackState>, next: StackState) -> bool {
    let mut rejected = None;
    let changed = tx.send_if_modified(|current| {
        if current.can_advance_to(&next) {
            *current = next.clone();
            true
        } else {
            rejected = Some(current.name());
            false
        }
    });

    if let Some(from) = rejected {
        warn!(
            "Ignoring stack state transition {} -> {}",
            from,
            next.name()
        );
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> StackState {
        StackState::Failed(Arc::new(InitError::Aborted))
    }

    #[test]
    fn test_fresh_store_path() {
        let (tx, rx) = watch::channel(StackState::Uninitialized);

        assert!(advance(&tx, StackState::Opening));
        assert!(advance(&tx, StackState::Seeding));
        assert!(advance(&tx, StackState::Ready { preexisting: false }));

        assert!(rx.borrow().is_ready());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let (tx, rx) = watch::channel(StackState::Uninitialized);
        advance(&tx, StackState::Opening);
        advance(&tx, failed());

        assert!(!advance(&tx, StackState::Ready { preexisting: true }));
        assert!(!advance(&tx, StackState::Opening));
        assert!(rx.borrow().is_failed());
        assert!(rx.borrow().is_terminal());
    }

    #[test]
    fn test_cannot_skip_opening() {
        let (tx, rx) = watch::channel(StackState::Uninitialized);

        assert!(!advance(&tx, StackState::Ready { preexisting: true }));
        assert!(!advance(&tx, StackState::Seeding));
        assert_eq!(rx.borrow().name(), "uninitialized");
    }

    #[test]
    fn test_preexisting_store_skips_seeding() {
        assert!(StackState::Opening.can_advance_to(&StackState::Ready { preexisting: true }));
        assert!(!StackState::Seeding.can_advance_to(&StackState::Seeding));
    }
}
