//! Cooperative cancellation signal.

use std::sync::{
    atomic::{
        Ordering::{Acquire, AcqRel},
        AtomicBool,
    },
    Arc,
};
use tokio::sync::Notify;


/// Clonable cancellation signal
///
/// All clones share one flag. Once [`cancel`](Self::cancel) is called on any clone, the flag is
/// permanently set and every pending and future [`cancelled`](Self::cancelled) call resolves.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<Shared>);

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// Construct a token which is not yet cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    ///
    /// Idempotent. Wakes every task waiting on [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        if !self.0.cancelled.swap(true, AcqRel) {
            trace!("cancellation requested");
            self.0.notify.notify_waiters();
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Acquire)
    }

    /// Wait until cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent cancel cannot slip between them.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
