use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and the I/O it starts.
///
/// Readers check the token between steps and in every poll slice, so a raised
/// token aborts an exchange within half a second.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the token. Every clone observes it.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lower the token so it can be reused for a new exchange.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
