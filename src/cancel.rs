//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, ShardSearchError};

/// A shared cancellation flag.
///
/// Every clone observes the same flag. Cancelling never blocks; work that
/// holds a token polls it at bounded intervals and unwinds on its own.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, not-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. Returns `true` only for the call that flipped the flag.
    pub fn cancel(&self) -> bool {
        self.cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with [`ShardSearchError::Terminated`] once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ShardSearchError::Terminated)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_and_idempotent() {
        let token = CancellationToken::new();
        let clone = token.clone();

        assert!(token.check().is_ok());
        assert!(clone.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ShardSearchError::Terminated)));
    }
}
