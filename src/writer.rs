use crate::cancel::{CancelContext, CancelReason};
use crate::upstream::StreamDelta;
use axum::body::Body;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

type BodyChunk = Result<Bytes, std::io::Error>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("caller disconnected")]
    Disconnected,
    #[error("output stream already terminated")]
    Terminated,
    #[error("write abandoned: {}", .0.as_str())]
    Cancelled(CancelReason),
}

/// Caller-facing half of a chunked response body.
///
/// Deltas are forwarded one chunk each as soon as they are written; the bounded channel is the
/// only buffering. A write waiting on a full channel gives up as soon as the cancel context fires.
/// The first of `close`/`fail` ends the body and every later call is a no-op.
pub struct StreamWriter {
    tx: Option<mpsc::Sender<BodyChunk>>,
    cancel: CancelContext,
    deltas_written: u64,
    bytes_written: u64,
}

impl StreamWriter {
    pub fn channel(cancel: CancelContext, capacity: usize) -> (Self, Body) {
        let (tx, rx) = mpsc::channel::<BodyChunk>(capacity.max(1));
        let writer = Self {
            tx: Some(tx),
            cancel,
            deltas_written: 0,
            bytes_written: 0,
        };
        (writer, Body::from_stream(ReceiverStream::new(rx)))
    }

    pub fn deltas_written(&self) -> u64 {
        self.deltas_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub async fn write(&mut self, delta: StreamDelta) -> Result<(), WriteError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(WriteError::Terminated);
        };
        let chunk = Bytes::from(delta.text);
        let len = chunk.len() as u64;
        let sent = tokio::select! {
            biased;
            reason = self.cancel.cancelled() => return Err(WriteError::Cancelled(reason)),
            sent = tx.send(Ok(chunk)) => sent,
        };
        if sent.is_err() {
            self.tx = None;
            self.cancel.cancel(CancelReason::ClientDisconnected);
            return Err(WriteError::Disconnected);
        }
        self.deltas_written += 1;
        self.bytes_written += len;
        Ok(())
    }

    /// Ends the body gracefully. Returns `false` if the stream was already terminated.
    pub fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }

    /// Ends the body with an error so the transport aborts the response instead of finishing it.
    /// If the channel is full and the context is cancelled first, the body just ends.
    /// Returns `false` if the stream was already terminated.
    pub async fn fail(&mut self, message: impl Into<String>) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        let frame = Err(std::io::Error::other(message.into()));
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = tx.send(frame) => {}
        }
        true
    }

    /// Resolves when the caller has dropped the response body, firing the cancellation context.
    /// Never resolves once the writer has terminated.
    pub async fn client_gone(&self) {
        match self.tx.as_ref() {
            Some(tx) => {
                tx.closed().await;
                self.cancel.cancel(CancelReason::ClientDisconnected);
            }
            None => std::future::pending::<()>().await,
        }
    }
}
