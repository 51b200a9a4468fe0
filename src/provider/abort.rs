//! Abort controller shared between the server and a running provider call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct AbortState {
    aborted: AtomicBool,
    notify: Notify,
}

/// Read side handed to providers. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the controller is aborted; immediately if it already was.
    pub async fn aborted(&self) {
        // Register interest before checking the flag so an abort between the
        // check and the await is not lost (Notify does not buffer for waiters).
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }
}

/// Owner side of one cancelable operation.
#[derive(Debug)]
pub struct AbortController {
    id: u64,
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::SeqCst),
            signal: AbortSignal::default(),
        }
    }

    /// Process-unique id, used to tell a finishing operation from its successor.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    pub fn abort(&self) {
        self.signal.state.aborted.store(true, Ordering::SeqCst);
        self.signal.state.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}
