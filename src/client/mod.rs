//! Channel client.
//!
//! Runs next to the UI. Opens the channel on first use, tags every request
//! with a correlation id and routes incoming events to the call that is
//! waiting on them.

mod pending;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, DEFAULT_CHANNEL_NAME};
use crate::error::BridgeError;
use crate::prompt::{AppContext, PromptBuilder};
use crate::protocol::{
    Availability, AvailabilityStatus, Event, EventEnvelope, PromptData, Request, RequestEnvelope,
    Turn, UsageInfo,
};
use crate::transport::{Port, Transport};

use pending::PendingCalls;
pub use pending::{EventSequence, Step};

/// Content fragments of one model reply, in arrival order.
pub type ResponseStream = EventSequence<String>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub channel_name: String,
    /// Overrides the built-in system prompt template.
    pub system_prompt: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            system_prompt: None,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel_name: config.channel_name.clone(),
            system_prompt: config.system_prompt.clone(),
        }
    }
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
    reader: JoinHandle<()>,
}

struct Shared {
    pending: Arc<PendingCalls>,
    connection: Mutex<Option<Connection>>,
    active_session: AtomicBool,
}

pub struct ChannelClient {
    transport: Arc<dyn Transport>,
    channel_name: String,
    prompts: PromptBuilder,
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    next_connection_id: AtomicU64,
}

impl ChannelClient {
    /// No channel is opened until the first call.
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            channel_name: options.channel_name,
            prompts: PromptBuilder::new(options.system_prompt),
            shared: Arc::new(Shared {
                pending: Arc::new(PendingCalls::default()),
                connection: Mutex::new(None),
                active_session: AtomicBool::new(false),
            }),
            next_request_id: AtomicU64::new(1),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn has_active_session(&self) -> bool {
        self.shared.active_session.load(Ordering::SeqCst)
    }

    /// Never fails: transport and provider errors come back as status `error`.
    pub async fn check_availability(&self) -> Availability {
        let result = self
            .call(Request::CheckAvailability, |event| match event {
                Event::Availability { status, message } => {
                    Step::Yield(Availability::new(status, message))
                }
                Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
                other => unexpected(other),
            })
            .await;

        result.unwrap_or_else(|e| {
            log::warn!("Availability check failed: {}", e);
            Availability::new(
                AvailabilityStatus::Error,
                format!("Error checking availability: {}", e),
            )
        })
    }

    /// Provisions the model. `on_progress` sees each reported fraction in
    /// `[0, 1]`. Supersedes any download or prompt this client has in flight.
    pub async fn download_model<F>(&self, on_progress: F) -> Result<(), BridgeError>
    where
        F: Fn(f64) + Send + 'static,
    {
        self.call(Request::DownloadModel, move |event| match event {
            Event::DownloadProgress { progress } => {
                on_progress(progress);
                Step::Skip
            }
            Event::DownloadComplete => Step::Yield(()),
            Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
            other => unexpected(other),
        })
        .await?;

        self.shared.active_session.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Creates the server's model session, replacing any existing one.
    pub async fn create_session(&self) -> Result<bool, BridgeError> {
        let created = self
            .call(Request::CreateSession, |event| match event {
                Event::SessionCreated => Step::Yield(true),
                Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
                other => unexpected(other),
            })
            .await?;

        self.shared.active_session.store(true, Ordering::SeqCst);
        Ok(created)
    }

    /// Sends the conversation and returns the reply as a lazy stream.
    ///
    /// Fails with [`BridgeError::NoActiveSession`] without touching the channel
    /// when no session is active. A provider failure surfaces on the stream's
    /// next pull. Supersedes any download or prompt this client has in flight.
    pub async fn prompt_streaming(
        &self,
        user_message: &str,
        history: &[Turn],
        ctx: &AppContext,
    ) -> Result<ResponseStream, BridgeError> {
        if !self.has_active_session() {
            return Err(BridgeError::NoActiveSession);
        }

        let messages = self.prompts.build_turns(user_message, history, ctx);
        let request = Request::PromptStreaming {
            data: PromptData { messages },
        };
        self.start(request, |event| match event {
            Event::Chunk { content } => Step::Yield(content),
            Event::Complete => Step::End,
            Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
            other => unexpected(other),
        })
        .await
    }

    /// `None` when the server holds no session.
    pub async fn get_usage_info(&self) -> Result<Option<UsageInfo>, BridgeError> {
        self.call(Request::GetUsageInfo, |event| match event {
            Event::UsageInfo { data } => Step::Yield(data),
            Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
            other => unexpected(other),
        })
        .await
    }

    /// Tears down the server session and releases the channel.
    ///
    /// Best effort: failures are logged. Every call still pending on this
    /// client fails with [`BridgeError::Aborted`].
    pub async fn destroy_session(&self) {
        self.shared.active_session.store(false, Ordering::SeqCst);
        self.shared.pending.fail_all(BridgeError::Aborted);

        let result = self
            .call(Request::DestroySession, |event| match event {
                Event::SessionDestroyed => Step::Yield(()),
                Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
                other => unexpected(other),
            })
            .await;
        if let Err(e) = result {
            log::warn!("destroy-session did not complete: {}", e);
        }

        self.release().await;
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn call<T>(
        &self,
        request: Request,
        mapper: impl FnMut(Event) -> Step<T> + Send + 'static,
    ) -> Result<T, BridgeError> {
        self.start(request, mapper).await?.settle().await
    }

    /// Registers the call, then sends it. The pending entry exists before the
    /// request leaves, so no reply can race past it.
    async fn start<T>(
        &self,
        request: Request,
        mapper: impl FnMut(Event) -> Step<T> + Send + 'static,
    ) -> Result<EventSequence<T>, BridgeError> {
        let kind = request.kind();
        let id = self.next_id();
        let value = RequestEnvelope::new(id, request).to_value()?;

        let mut slot = self.shared.connection.lock().await;
        if kind.is_cancelable() {
            self.shared.pending.fail_cancelable(BridgeError::Aborted);
        }

        let connection = self.connect(&mut slot).await?;
        let events = self.shared.pending.register(id, kind, connection.id);
        let call = EventSequence::new(id, events, self.shared.pending.clone(), mapper);

        if connection.tx.send(value).is_err() {
            log::warn!("Channel '{}' closed while sending {}", self.channel_name, kind);
            if let Some(stale) = slot.take() {
                stale.reader.abort();
                self.shared
                    .pending
                    .fail_connection(stale.id, BridgeError::ChannelClosed);
            }
            return Err(BridgeError::ChannelClosed);
        }

        log::debug!("Sent {} (id={})", kind, id);
        Ok(call)
    }

    /// Returns the open connection, opening one if there is none or the
    /// previous one was closed by the peer.
    async fn connect<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> Result<&'a Connection, BridgeError> {
        if slot.as_ref().is_some_and(|c| c.tx.is_closed()) {
            if let Some(stale) = slot.take() {
                log::info!("Channel '{}' was closed, reconnecting", self.channel_name);
                stale.reader.abort();
                self.shared
                    .pending
                    .fail_connection(stale.id, BridgeError::ChannelClosed);
            }
        }

        if slot.is_none() {
            let Port { tx, rx, .. } = self.transport.open(&self.channel_name).await?;
            let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
            let reader = spawn_reader(self.shared.clone(), id, rx);
            log::info!("Opened channel '{}' (connection {})", self.channel_name, id);
            *slot = Some(Connection { id, tx, reader });
        }

        slot.as_ref().ok_or(BridgeError::ChannelClosed)
    }

    async fn release(&self) {
        let connection = self.shared.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.reader.abort();
            self.shared
                .pending
                .fail_connection(connection.id, BridgeError::ChannelClosed);
            log::info!("Released channel '{}'", self.channel_name);
        }
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        // The reader task holds `shared`; stop it so the channel closes. Its
        // own cleanup never runs after the abort, so settle its calls here.
        if let Ok(mut slot) = self.shared.connection.try_lock() {
            if let Some(connection) = slot.take() {
                connection.reader.abort();
            }
        }
        self.shared.pending.fail_all(BridgeError::ChannelClosed);
    }
}

/// Progress-type strays are skipped. A stray terminal event ends the call, so
/// it has to fail it rather than let a stream end as if complete.
fn unexpected<T>(event: Event) -> Step<T> {
    if event.is_terminal() {
        log::warn!("Unexpected terminal {} event", event.name());
        return Step::Fail(BridgeError::Protocol(format!(
            "unexpected {} event",
            event.name()
        )));
    }
    log::warn!("Ignoring unexpected {} event", event.name());
    Step::Skip
}

fn spawn_reader(
    shared: Arc<Shared>,
    connection: u64,
    mut rx: mpsc::UnboundedReceiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(value) = rx.recv().await {
            let envelope = match EventEnvelope::from_value(value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    log::warn!("Ignoring malformed event: {}", e);
                    continue;
                }
            };

            let name = envelope.body.name();
            if !shared.pending.deliver(envelope.id, envelope.body) {
                log::debug!(
                    "Dropping {} event for request {} (no pending call)",
                    name,
                    envelope.id
                );
            }
        }

        log::info!("Channel closed by peer (connection {})", connection);
        shared
            .pending
            .fail_connection(connection, BridgeError::ChannelClosed);

        let mut slot = shared.connection.lock().await;
        if slot.as_ref().map(|c| c.id) == Some(connection) {
            *slot = None;
        }
    })
}
