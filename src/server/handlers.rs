//! One handler per request kind.
//!
//! Each handler applies its state transition synchronously (in request arrival
//! order) and returns the remainder of its work as a future for the dispatch
//! loop to spawn. Provider failures are converted to a single `error` event
//! here; nothing propagates into the loop.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use super::state::{OperationTicket, ServerContext};
use crate::protocol::{
    AvailabilityReport, AvailabilityStatus, Event, EventEnvelope, Request, Turn, UsageInfo,
};
use crate::provider::{ModelSession, ProviderError};

pub(crate) type Task = BoxFuture<'static, ()>;

/// Sends events correlated with one request.
#[derive(Debug, Clone)]
pub(crate) struct Responder {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

impl Responder {
    pub(crate) fn new(id: u64, tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { id, tx }
    }

    pub(crate) fn emit(&self, event: Event) {
        let name = event.name();
        let value = match EventEnvelope::new(self.id, event).to_value() {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to encode {} event: {}", name, e);
                return;
            }
        };
        if self.tx.send(value).is_err() {
            log::debug!("Channel closed, dropping {} event for request {}", name, self.id);
        }
    }
}

pub(crate) fn dispatch(ctx: &Arc<ServerContext>, out: Responder, request: Request) -> Task {
    log::debug!("Handling {} (id={})", request.kind(), out.id);
    match request {
        Request::CheckAvailability => check_availability(ctx, out),
        Request::DownloadModel => download_model(ctx, out),
        Request::CreateSession => create_session(ctx, out),
        Request::PromptStreaming { data } => prompt_streaming(ctx, out, data.messages),
        Request::GetUsageInfo => get_usage_info(ctx, out),
        Request::DestroySession => destroy_session(ctx, out),
    }
}

fn check_availability(ctx: &Arc<ServerContext>, out: Responder) -> Task {
    let provider = ctx.provider();
    async move {
        let report = AvailabilityReport::from_query(provider.availability().await);
        if report.status == AvailabilityStatus::Error {
            log::warn!("{}", report.message);
        }
        out.emit(Event::Availability {
            status: report.status,
            message: report.message,
        });
    }
    .boxed()
}

fn download_model(ctx: &Arc<ServerContext>, out: Responder) -> Task {
    let ticket = ctx.begin_operation();
    let ctx = ctx.clone();
    async move {
        let OperationTicket { id, signal } = ticket;

        let progress_out = out.clone();
        let progress_ctx = ctx.clone();
        let on_progress = Box::new(move |progress: f64| {
            progress_ctx.while_current(id, || {
                progress_out.emit(Event::DownloadProgress { progress })
            });
        });

        let result = ctx.provider().download(on_progress, signal.clone()).await;
        let event = match result {
            _ if signal.is_aborted() => None,
            Ok(()) => Some(Event::DownloadComplete),
            Err(ProviderError::Aborted) => None,
            Err(e) => {
                log::error!("Model download failed: {}", e);
                Some(Event::error(e.to_string()))
            }
        };
        let emitted = match event {
            Some(event) => ctx.while_current(id, || out.emit(event)),
            None => false,
        };
        if !emitted {
            log::info!("Download {} aborted", id);
        }
        ctx.finish_operation(id);
    }
    .boxed()
}

fn create_session(ctx: &Arc<ServerContext>, out: Responder) -> Task {
    let (previous, generation) = ctx.take_session();
    let ctx = ctx.clone();
    async move {
        if let Some(previous) = previous {
            log::info!("Destroying session {} before creating a new one", previous.id());
            previous.destroy().await;
        }

        match ctx.provider().create_session().await {
            Ok(session) => match ctx.install_session(generation, session) {
                Ok(()) => out.emit(Event::SessionCreated),
                Err(stale) => {
                    log::info!("Session {} was destroyed before creation completed", stale.id());
                    stale.destroy().await;
                    out.emit(Event::error("Session was destroyed before creation completed"));
                }
            },
            Err(e) => {
                log::error!("Failed to create session: {}", e);
                out.emit(Event::error(e.to_string()));
            }
        }
    }
    .boxed()
}

fn prompt_streaming(ctx: &Arc<ServerContext>, out: Responder, turns: Vec<Turn>) -> Task {
    let Some(session) = ctx.current_session() else {
        out.emit(Event::error("No active session"));
        return futures::future::ready(()).boxed();
    };
    let ticket = ctx.begin_operation();
    let ctx = ctx.clone();
    async move {
        let id = ticket.id;
        stream_reply(&ctx, session, turns, ticket, &out).await;
        ctx.finish_operation(id);
    }
    .boxed()
}

async fn stream_reply(
    ctx: &ServerContext,
    session: Arc<dyn ModelSession>,
    turns: Vec<Turn>,
    ticket: OperationTicket,
    out: &Responder,
) {
    let OperationTicket { id, signal } = ticket;

    let mut stream = match session.prompt_streaming(turns, signal.clone()).await {
        Ok(stream) => stream,
        Err(_) if signal.is_aborted() => return,
        Err(ProviderError::Aborted) => return,
        Err(e) => {
            log::error!("Prompt {} failed: {}", id, e);
            ctx.while_current(id, || out.emit(Event::error(e.to_string())));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = signal.aborted() => {
                log::debug!("Prompt {} aborted mid-stream", id);
                return;
            }
            next = stream.next() => next,
        };

        let (event, last) = match next {
            Some(Ok(content)) => (Event::Chunk { content }, false),
            Some(Err(ProviderError::Aborted)) => return,
            Some(Err(e)) => {
                log::error!("Prompt {} failed mid-stream: {}", id, e);
                (Event::error(e.to_string()), true)
            }
            None => (Event::Complete, true),
        };

        // The provider may have yielded before observing the abort.
        if signal.is_aborted() || !ctx.while_current(id, || out.emit(event)) {
            log::debug!("Prompt {} aborted mid-stream", id);
            return;
        }
        if last {
            return;
        }
    }
}

fn get_usage_info(ctx: &Arc<ServerContext>, out: Responder) -> Task {
    let data = ctx
        .current_session()
        .map(|session| UsageInfo::new(session.input_usage(), session.input_quota()));
    out.emit(Event::UsageInfo { data });
    futures::future::ready(()).boxed()
}

fn destroy_session(ctx: &Arc<ServerContext>, out: Responder) -> Task {
    let (previous, _) = ctx.take_session();
    ctx.abort_operation();
    async move {
        if let Some(session) = previous {
            log::info!("Destroying session {}", session.id());
            session.destroy().await;
        }
        out.emit(Event::SessionDestroyed);
    }
    .boxed()
}
