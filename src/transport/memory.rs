//! In-process transport: client and server share one address space.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Listener, Port, Transport};
use crate::error::BridgeError;

/// Creates a connected client-side transport and server-side listener.
pub fn memory_transport() -> (MemoryTransport, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryTransport { incoming: tx }, MemoryListener { incoming: rx })
}

/// Client side of the in-process hub. Clone freely; each `open` is a new channel.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: mpsc::UnboundedSender<Port>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, name: &str) -> Result<Port, BridgeError> {
        let (client, server) = Port::pair(name);
        self.incoming
            .send(server)
            .map_err(|_| BridgeError::Channel(format!("No listener for channel '{}'", name)))?;
        log::debug!("Opened in-process channel '{}'", name);
        Ok(client)
    }
}

/// Server side of the in-process hub.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Port>,
}

impl MemoryListener {
    /// Refuses further connections. Ports already accepted stay open.
    pub fn close(&mut self) {
        self.incoming.close();
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<Port> {
        self.incoming.recv().await
    }
}
