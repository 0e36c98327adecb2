// Cancellation for blocking socket calls
use crate::error::{ShmsockError, ShmsockResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that interrupts every blocking call observing it
///
/// Waits poll the flag at least once per poll interval, so a cancelled call
/// returns within one interval even if nobody rings its doorbell.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Re-arm the token after a cancellation has been handled
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    /// Cancel this token on Ctrl+C
    ///
    /// Only one handler can be installed per process.
    pub fn install_interrupt_handler(&self) -> ShmsockResult<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            log::info!("Interrupt received, cancelling blocking socket calls");
            token.cancel();
        })
        .map_err(|e| ShmsockError::config(format!("Failed to set signal handler: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.reset();
        assert!(!token.is_cancelled());
    }
}
