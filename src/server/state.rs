//! Session and cancellation state shared by every handler.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::provider::{AbortController, AbortSignal, ModelProvider, ModelSession};

struct SessionSlot {
    handle: Option<Arc<dyn ModelSession>>,
    /// Bumped every time the slot is emptied, so a create that started before
    /// a destroy can tell its handle is stale.
    generation: u64,
}

/// The server's single model session and single in-flight operation.
///
/// One context serves every connection of the process. Handlers never hold a
/// lock across an await.
pub struct ServerContext {
    provider: Arc<dyn ModelProvider>,
    session: Mutex<SessionSlot>,
    operation: Mutex<Option<AbortController>>,
}

/// Handle to an operation started with [`ServerContext::begin_operation`].
#[derive(Debug, Clone)]
pub struct OperationTicket {
    pub id: u64,
    pub signal: AbortSignal,
}

impl ServerContext {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            session: Mutex::new(SessionSlot {
                handle: None,
                generation: 0,
            }),
            operation: Mutex::new(None),
        }
    }

    pub fn provider(&self) -> Arc<dyn ModelProvider> {
        self.provider.clone()
    }

    // -----------------------------------------------------------------------
    // Session slot
    // -----------------------------------------------------------------------

    pub fn current_session(&self) -> Option<Arc<dyn ModelSession>> {
        self.session.lock().handle.clone()
    }

    pub fn has_session(&self) -> bool {
        self.session.lock().handle.is_some()
    }

    /// Empties the slot and returns the previous handle for teardown, along
    /// with the new generation.
    pub fn take_session(&self) -> (Option<Arc<dyn ModelSession>>, u64) {
        let mut slot = self.session.lock();
        slot.generation += 1;
        (slot.handle.take(), slot.generation)
    }

    /// Installs a freshly created handle if nothing emptied the slot since
    /// `generation` was taken. On a stale generation the handle is handed back.
    pub fn install_session(
        &self,
        generation: u64,
        session: Arc<dyn ModelSession>,
    ) -> Result<(), Arc<dyn ModelSession>> {
        let mut slot = self.session.lock();
        if slot.generation != generation {
            return Err(session);
        }
        slot.handle = Some(session);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operation slot
    // -----------------------------------------------------------------------

    /// Aborts the in-flight operation, if any, and registers a new one.
    pub fn begin_operation(&self) -> OperationTicket {
        let controller = AbortController::new();
        let ticket = OperationTicket {
            id: controller.id(),
            signal: controller.signal(),
        };
        let previous = self.operation.lock().replace(controller);
        if let Some(previous) = previous {
            log::debug!("Aborting operation {} in favor of {}", previous.id(), ticket.id);
            previous.abort();
        }
        ticket
    }

    /// Clears the slot if it still holds operation `id`. A newer operation is
    /// left untouched.
    pub fn finish_operation(&self, id: u64) {
        let mut slot = self.operation.lock();
        if slot.as_ref().map(AbortController::id) == Some(id) {
            *slot = None;
        }
    }

    /// Runs `f` only if operation `id` still holds the slot. The slot stays
    /// locked while `f` runs, so nothing `f` emits can follow events of an
    /// operation that replaced it. `f` must not block.
    pub fn while_current(&self, id: u64, f: impl FnOnce()) -> bool {
        let slot = self.operation.lock();
        if slot.as_ref().map(AbortController::id) != Some(id) {
            return false;
        }
        f();
        true
    }

    /// Aborts and clears the in-flight operation. Returns whether one existed.
    pub fn abort_operation(&self) -> bool {
        match self.operation.lock().take() {
            Some(controller) => {
                log::debug!("Aborting operation {}", controller.id());
                controller.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_operation(&self) -> bool {
        self.operation.lock().is_some()
    }
}
