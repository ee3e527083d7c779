use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A shared cancellation token.
///
/// A clone travels with every layer that may suspend (socket reads and
/// writes, TLS handshakes), and is level-checked at each suspension
/// point. Cancelling is idempotent and cannot be undone.
#[derive(Clone, Default)]
pub struct Cancellable {
    inner: Arc<AtomicBool>,
}

impl Cancellable {
    pub fn new() -> Cancellable {
        Cancellable {
            inner: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
