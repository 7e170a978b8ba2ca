use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared flag for cooperative cancellation.
///
/// Clones share the same flag. A copy run checks it at every file boundary, so
/// cancelling never interrupts a file that is already being written.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
