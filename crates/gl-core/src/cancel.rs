use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

// ---------------------------------------------------------------------------
// CancellationToken — cooperative cancellation
// ---------------------------------------------------------------------------

/// Broadcast-based cooperative cancellation token.
///
/// One token is attached to each [`crate::context::AnalysisContext`] and
/// passed by reference through every call that may block. Blocking code
/// either polls `is_cancelled()` on its tick or `select!`s on
/// `cancelled()` alongside its main future:
///
/// ```ignore
/// tokio::select! {
///     _ = token.cancelled() => { /* unwind */ }
///     out = do_work() => { /* normal path */ }
/// }
/// ```
///
/// Cancellation is cooperative: triggering the token does not kill work that
/// ignores it. Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    trigger: broadcast::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check whether cancellation was requested (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation. Idempotent: only the first call broadcasts.
    pub fn cancel(&self) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            debug!("cancellation requested");
            let _ = self.trigger.send(());
        }
    }

    /// Resolve once cancellation is requested. Returns immediately if the
    /// token was already cancelled when called.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.trigger.subscribe();
        // Re-check after subscribing: cancel() may have raced the subscribe.
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
