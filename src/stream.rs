//! Unbounded, single-consumer asynchronous sequence.
//!
//! A [`SequenceWriter`] pushes items that a [`Sequence`] yields in push order.
//! Items pushed before the consumer polls are buffered, never dropped. The
//! writer ends the sequence with [`SequenceWriter::finish`] or
//! [`SequenceWriter::fail`]; a writer dropped without either reads as
//! [`BridgeError::Aborted`].

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::error::BridgeError;

enum Slot<T> {
    Item(T),
    Failed(BridgeError),
    Finished,
}

/// Creates a connected writer/reader pair.
pub fn sequence<T>() -> (SequenceWriter<T>, Sequence<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SequenceWriter { tx }, Sequence { rx, done: false })
}

/// Producer half.
pub struct SequenceWriter<T> {
    tx: mpsc::UnboundedSender<Slot<T>>,
}

impl<T> SequenceWriter<T> {
    /// Appends an item. Returns false once the reader has been dropped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(Slot::Item(item)).is_ok()
    }

    /// Ends the sequence with an error, yielded after any buffered items.
    pub fn fail(self, error: BridgeError) {
        let _ = self.tx.send(Slot::Failed(error));
    }

    /// Ends the sequence normally.
    pub fn finish(self) {
        let _ = self.tx.send(Slot::Finished);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half. Forward-only and single-pass.
pub struct Sequence<T> {
    rx: mpsc::UnboundedReceiver<Slot<T>>,
    done: bool,
}

impl<T> Sequence<T> {
    pub fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Stream for Sequence<T> {
    type Item = Result<T, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Slot::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Slot::Failed(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(Slot::Finished)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(BridgeError::Aborted)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
