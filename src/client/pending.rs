//! Calls awaiting events, keyed by correlation id.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::error::BridgeError;
use crate::protocol::{Event, RequestKind};
use crate::stream::{sequence, Sequence, SequenceWriter};

struct PendingCall {
    kind: RequestKind,
    connection: u64,
    writer: SequenceWriter<Event>,
}

/// Registry of in-flight calls. Events for ids it does not know are dropped.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<u64, PendingCall>>,
}

impl PendingCalls {
    pub(crate) fn register(&self, id: u64, kind: RequestKind, connection: u64) -> Sequence<Event> {
        let (writer, events) = sequence();
        self.calls.lock().insert(
            id,
            PendingCall {
                kind,
                connection,
                writer,
            },
        );
        events
    }

    /// Routes one event. A terminal event settles and removes the call.
    /// Returns false when no call is waiting on `id`.
    pub(crate) fn deliver(&self, id: u64, event: Event) -> bool {
        let mut calls = self.calls.lock();
        let Some(call) = calls.get(&id) else {
            return false;
        };

        if event.is_terminal() {
            if let Some(call) = calls.remove(&id) {
                call.writer.push(event);
                call.writer.finish();
            }
        } else if !call.writer.push(event) {
            // Reader is gone; nobody will ever consume the rest.
            calls.remove(&id);
        }
        true
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.calls.lock().remove(&id).is_some()
    }

    /// Fails every download or prompt still waiting. The server aborts these
    /// silently when a newer one starts.
    pub(crate) fn fail_cancelable(&self, error: BridgeError) {
        self.fail_where(|call| call.kind.is_cancelable(), error);
    }

    /// Fails every call sent over `connection`.
    pub(crate) fn fail_connection(&self, connection: u64, error: BridgeError) {
        self.fail_where(|call| call.connection == connection, error);
    }

    pub(crate) fn fail_all(&self, error: BridgeError) {
        self.fail_where(|_| true, error);
    }

    fn fail_where(&self, predicate: impl Fn(&PendingCall) -> bool, error: BridgeError) {
        let failed: Vec<(u64, PendingCall)> = {
            let mut calls = self.calls.lock();
            let ids: Vec<u64> = calls
                .iter()
                .filter(|(_, call)| predicate(*call))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| calls.remove(&id).map(|call| (id, call)))
                .collect()
        };

        for (id, call) in failed {
            log::debug!("Failing pending {} (id={}): {}", call.kind, id, error);
            call.writer.fail(error.clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// What a call makes of one of its events.
pub enum Step<T> {
    Yield(T),
    Skip,
    End,
    Fail(BridgeError),
}

type Mapper<T> = Box<dyn FnMut(Event) -> Step<T> + Send>;

/// The events of one call, mapped to the values its caller wants.
///
/// Dropping it deregisters the call, so late events for it are discarded.
pub struct EventSequence<T> {
    id: u64,
    events: Sequence<Event>,
    pending: Arc<PendingCalls>,
    mapper: Mapper<T>,
    done: bool,
}

impl<T> EventSequence<T> {
    pub(crate) fn new(
        id: u64,
        events: Sequence<Event>,
        pending: Arc<PendingCalls>,
        mapper: impl FnMut(Event) -> Step<T> + Send + 'static,
    ) -> Self {
        Self {
            id,
            events,
            pending,
            mapper: Box::new(mapper),
            done: false,
        }
    }

    /// Correlation id of the request behind this sequence.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the first mapped value. Used by calls that settle once.
    pub async fn settle(mut self) -> Result<T, BridgeError> {
        match self.next().await {
            Some(result) => result,
            None => Err(BridgeError::Protocol(format!(
                "Request {} ended without a result",
                self.id
            ))),
        }
    }
}

impl<T> Stream for EventSequence<T> {
    type Item = Result<T, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            let event = match Pin::new(&mut this.events).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(event))) => event,
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
            };

            match (this.mapper)(event) {
                Step::Yield(value) => return Poll::Ready(Some(Ok(value))),
                Step::Skip => continue,
                Step::End => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Step::Fail(error) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(error)));
                }
            }
        }
    }
}

impl<T> Drop for EventSequence<T> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(event: Event) -> Step<String> {
        match event {
            Event::Chunk { content } => Step::Yield(content),
            Event::Complete => Step::End,
            Event::Error { message } => Step::Fail(BridgeError::Provider(message)),
            _ => Step::Skip,
        }
    }

    fn chunk(content: &str) -> Event {
        Event::Chunk {
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn terminal_event_settles_and_removes_call() {
        let pending = Arc::new(PendingCalls::default());
        let events = pending.register(1, RequestKind::PromptStreaming, 1);
        let stream = EventSequence::new(1, events, pending.clone(), chunks);

        assert!(pending.deliver(1, chunk("a")));
        assert!(pending.deliver(1, chunk("b")));
        assert!(pending.deliver(1, Event::Complete));
        assert_eq!(pending.len(), 0);
        assert!(!pending.deliver(1, chunk("late")));

        let collected: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(collected, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn error_event_fails_next_pull() {
        let pending = Arc::new(PendingCalls::default());
        let events = pending.register(2, RequestKind::PromptStreaming, 1);
        let mut stream = EventSequence::new(2, events, pending.clone(), chunks);

        pending.deliver(2, chunk("partial"));
        pending.deliver(2, Event::error("overloaded"));

        assert_eq!(stream.next().await, Some(Ok("partial".to_string())));
        assert_eq!(
            stream.next().await,
            Some(Err(BridgeError::Provider("overloaded".into())))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn fail_cancelable_leaves_other_calls() {
        let pending = Arc::new(PendingCalls::default());
        let prompt = pending.register(1, RequestKind::PromptStreaming, 1);
        let _usage = pending.register(2, RequestKind::GetUsageInfo, 1);

        pending.fail_cancelable(BridgeError::Aborted);

        let mut prompt = EventSequence::new(1, prompt, pending.clone(), chunks);
        assert_eq!(prompt.next().await, Some(Err(BridgeError::Aborted)));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn fail_connection_only_touches_that_connection() {
        let pending = Arc::new(PendingCalls::default());
        let old = pending.register(1, RequestKind::CreateSession, 1);
        let _new = pending.register(2, RequestKind::CreateSession, 2);

        pending.fail_connection(1, BridgeError::ChannelClosed);

        let old = EventSequence::new(1, old, pending.clone(), |_| Step::Yield(()));
        assert_eq!(old.settle().await, Err(BridgeError::ChannelClosed));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn dropping_sequence_deregisters() {
        let pending = Arc::new(PendingCalls::default());
        let events = pending.register(3, RequestKind::PromptStreaming, 1);
        let stream = EventSequence::new(3, events, pending.clone(), chunks);

        drop(stream);
        assert_eq!(pending.len(), 0);
        assert!(!pending.deliver(3, chunk("stale")));
    }

    #[tokio::test]
    async fn settle_skips_progress_until_terminal() {
        let pending = Arc::new(PendingCalls::default());
        let events = pending.register(4, RequestKind::DownloadModel, 1);
        let mut seen = Vec::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let call = EventSequence::new(4, events, pending.clone(), move |event| match event {
            Event::DownloadProgress { progress } => {
                let _ = tx.send(progress);
                Step::Skip
            }
            Event::DownloadComplete => Step::Yield(()),
            _ => Step::Skip,
        });

        pending.deliver(4, Event::DownloadProgress { progress: 0.5 });
        pending.deliver(4, Event::DownloadComplete);

        assert_eq!(call.settle().await, Ok(()));
        while let Ok(progress) = rx.try_recv() {
            seen.push(progress);
        }
        assert_eq!(seen, vec![0.5]);
    }
}
