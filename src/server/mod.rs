//! Channel server.
//!
//! Runs in the privileged process and is the only owner of the model session
//! and of the in-flight abortable operation. Every accepted channel shares the
//! same [`ServerContext`].

mod handlers;
mod state;

use std::sync::Arc;

use crate::protocol::{message_type, RequestEnvelope};
use crate::provider::ModelProvider;
use crate::transport::{Listener, Port};

pub use state::{OperationTicket, ServerContext};

use handlers::Responder;

#[derive(Clone)]
pub struct ChannelServer {
    ctx: Arc<ServerContext>,
}

impl ChannelServer {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(provider)),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accepts channels until the listener is exhausted, serving each on its
    /// own task.
    pub async fn serve<L: Listener>(&self, mut listener: L) {
        while let Some(port) = listener.accept().await {
            let server = self.clone();
            tokio::spawn(async move { server.serve_port(port).await });
        }
        log::info!("Listener closed, no longer accepting channels");
    }

    /// Dispatch loop for one channel. Returns when the peer closes it.
    pub async fn serve_port(&self, port: Port) {
        let Port { name, tx, mut rx } = port;
        log::info!("Channel '{}' connected", name);

        while let Some(value) = rx.recv().await {
            let kind = message_type(&value).map(str::to_string);
            let envelope = match RequestEnvelope::from_value(value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!(
                        "Ignoring message on '{}' (type={}): {}",
                        name,
                        kind.as_deref().unwrap_or("<missing>"),
                        e
                    );
                    continue;
                }
            };

            let out = Responder::new(envelope.id, tx.clone());
            let task = handlers::dispatch(&self.ctx, out, envelope.body);
            tokio::spawn(task);
        }

        log::info!("Channel '{}' closed", name);
    }

    /// Aborts the in-flight operation and destroys the session, if any.
    pub async fn shutdown(&self) {
        self.ctx.abort_operation();
        let (session, _) = self.ctx.take_session();
        if let Some(session) = session {
            log::info!("Destroying session {} on shutdown", session.id());
            session.destroy().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Event, EventEnvelope, Request};
    use crate::provider::MockModelProvider;
    use crate::transport::memory_transport;
    use crate::transport::Transport;
    use serde_json::json;
    use std::time::Duration;

    async fn recv_event(port: &mut Port) -> EventEnvelope {
        let value = tokio::time::timeout(Duration::from_secs(5), port.rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open");
        EventEnvelope::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn unknown_request_types_are_ignored() {
        let server = ChannelServer::new(Arc::new(MockModelProvider::new()));
        let (mut client, server_port) = Port::pair("model-channel");
        tokio::spawn(async move { server.serve_port(server_port).await });

        client.tx.send(json!({ "type": "summon-dragon", "id": 1 })).unwrap();
        client.tx.send(json!({ "id": 2 })).unwrap();
        client
            .tx
            .send(RequestEnvelope::new(3, Request::GetUsageInfo).to_value().unwrap())
            .unwrap();

        let envelope = recv_event(&mut client).await;
        assert_eq!(envelope.id, 3);
        assert_eq!(envelope.body, Event::UsageInfo { data: None });
    }

    #[tokio::test]
    async fn serve_accepts_multiple_channels_sharing_state() {
        let server = ChannelServer::new(Arc::new(MockModelProvider::new()));
        let (transport, listener) = memory_transport();
        let ctx = server.context().clone();
        tokio::spawn(async move { server.serve(listener).await });

        let mut first = transport.open("a").await.unwrap();
        let mut second = transport.open("b").await.unwrap();

        first
            .tx
            .send(RequestEnvelope::new(1, Request::DestroySession).to_value().unwrap())
            .unwrap();
        assert_eq!(recv_event(&mut first).await.body, Event::SessionDestroyed);

        second
            .tx
            .send(RequestEnvelope::new(1, Request::GetUsageInfo).to_value().unwrap())
            .unwrap();
        assert_eq!(
            recv_event(&mut second).await.body,
            Event::UsageInfo { data: None }
        );
        assert!(!ctx.has_session());
    }
}
