//! Channel transports.
//!
//! A transport opens a named duplex [`Port`] carrying structured messages
//! (`serde_json::Value`). The port's receiver yielding `None` means the peer
//! closed the channel. Every concrete transport pumps its wire format into
//! these two unbounded queues, so the client and server never see bytes.

mod lines;
mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BridgeError;

pub use lines::{port_from_io, spawn_stderr_drain, stdio_port, ProcessTransport};
pub use memory::{memory_transport, MemoryListener, MemoryTransport};

/// One end of an open channel.
#[derive(Debug)]
pub struct Port {
    pub name: String,
    pub tx: mpsc::UnboundedSender<Value>,
    pub rx: mpsc::UnboundedReceiver<Value>,
}

impl Port {
    /// Two ports wired back to back.
    pub fn pair(name: &str) -> (Port, Port) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Port {
                name: name.to_string(),
                tx: a_tx,
                rx: a_rx,
            },
            Port {
                name: name.to_string(),
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

/// Opens channels on the client side.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, name: &str) -> Result<Port, BridgeError>;
}

/// Accepts channels on the server side.
#[async_trait]
pub trait Listener: Send {
    /// Next incoming port, or `None` once no more clients can connect.
    async fn accept(&mut self) -> Option<Port>;
}
