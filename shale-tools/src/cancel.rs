//! Cooperative cancellation.

/// Polled by long-running work between batches.
pub trait CancelToken: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Token that never fires.
pub struct NeverCancelled;

impl CancelToken for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

impl CancelToken for std::sync::atomic::AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(std::sync::atomic::Ordering::Relaxed)
    }
}
