use crate::app::AppState;
use crate::cancel::{CancelContext, CancelReason, DeadlineGuard};
use crate::error::AppError;
use crate::normalize::UpstreamMessage;
use crate::upstream::{self, DeltaStream, StreamDelta, StreamFailure};
use crate::writer::{StreamWriter, WriteError};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::Instrument;

const WRITER_CAPACITY: usize = 16;

/// Terminal state of one relay invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    UpstreamError {
        status: StatusCode,
        code: String,
        message: String,
    },
    TimedOut,
    ClientCancelled,
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::UpstreamError { .. } => "upstream_error",
            RelayOutcome::TimedOut => "timed_out",
            RelayOutcome::ClientCancelled => "client_cancelled",
        }
    }

    /// Response used when the relay ends before any delta was streamed.
    fn into_unstreamed_response(self) -> Response {
        match self {
            RelayOutcome::Completed => plain_text(axum::body::Body::empty()),
            RelayOutcome::UpstreamError {
                status,
                code,
                message,
            } => AppError::new(status, code, message)
                .with_type("upstream_error")
                .into_response(),
            RelayOutcome::TimedOut => AppError::gateway_timeout().into_response(),
            // Only reachable if the context is cancelled for disconnect before any writer exists;
            // a real disconnect at that stage drops the handler future instead.
            RelayOutcome::ClientCancelled => StatusCode::NO_CONTENT.into_response(),
        }
    }
}

impl From<StreamFailure> for RelayOutcome {
    fn from(failure: StreamFailure) -> Self {
        match failure {
            StreamFailure::Upstream(err) => RelayOutcome::UpstreamError {
                status: err.status_or_default(),
                code: err.error_code(),
                message: err.message,
            },
            StreamFailure::Cancelled(CancelReason::Deadline) => RelayOutcome::TimedOut,
            StreamFailure::Cancelled(CancelReason::ClientDisconnected) => {
                RelayOutcome::ClientCancelled
            }
        }
    }
}

/// Records exactly one outcome per relay. Dropping it unfinished means the request future was
/// dropped, which only happens when the caller went away.
struct OutcomeRecorder {
    started_at: Instant,
    finished: bool,
}

impl OutcomeRecorder {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self, outcome: &RelayOutcome, deltas: u64, bytes: u64) {
        if self.finished {
            return;
        }
        self.finished = true;
        let elapsed_ms = self.started_at.elapsed().as_millis() as u64;
        metrics::counter!("chat_relay_requests_total", "outcome" => outcome.label()).increment(1);
        match outcome {
            RelayOutcome::UpstreamError {
                status,
                code,
                message,
            } => tracing::warn!(
                outcome = outcome.label(),
                status = status.as_u16(),
                code = %code,
                message = %message,
                deltas,
                bytes,
                elapsed_ms,
                "relay finished"
            ),
            _ => tracing::info!(
                outcome = outcome.label(),
                deltas,
                bytes,
                elapsed_ms,
                "relay finished"
            ),
        }
    }
}

impl Drop for OutcomeRecorder {
    fn drop(&mut self) {
        self.finish(&RelayOutcome::ClientCancelled, 0, 0);
    }
}

/// Runs the relay for already-normalized messages.
///
/// The handler waits for the first delta so that failures before any output can still be
/// reported with a proper status. From the first delta on, the rest is pumped by a spawned task
/// while the caller reads the chunked body.
pub async fn start(state: &AppState, messages: Vec<UpstreamMessage>) -> Response {
    let mut recorder = OutcomeRecorder::new();
    let cancel = CancelContext::new();
    let deadline = cancel.arm_deadline(state.config.deadline);

    let opened = async {
        let mut deltas = upstream::open_completion_stream(
            &state.http,
            &state.config.upstream,
            &messages,
            &cancel,
        )
        .await?;
        let first = deltas.next_delta().await?;
        Ok::<_, StreamFailure>((deltas, first))
    }
    .await;

    let (deltas, first) = match opened {
        Ok((mut deltas, None)) => {
            deltas.abort();
            recorder.finish(&RelayOutcome::Completed, 0, 0);
            return RelayOutcome::Completed.into_unstreamed_response();
        }
        Ok((deltas, Some(first))) => (deltas, first),
        Err(failure) => {
            let outcome = RelayOutcome::from(failure);
            recorder.finish(&outcome, 0, 0);
            return outcome.into_unstreamed_response();
        }
    };

    metrics::histogram!("chat_relay_first_delta_seconds")
        .record(recorder.started_at.elapsed().as_secs_f64());

    let (writer, body) = StreamWriter::channel(cancel.clone(), WRITER_CAPACITY);
    tokio::spawn(
        pump(deltas, writer, first, deadline, recorder).instrument(tracing::Span::current()),
    );
    plain_text(body)
}

async fn pump(
    mut deltas: DeltaStream,
    mut writer: StreamWriter,
    first: StreamDelta,
    deadline: DeadlineGuard,
    mut recorder: OutcomeRecorder,
) {
    let mut pending = Some(first);
    let outcome = loop {
        let delta = match pending.take() {
            Some(delta) => delta,
            None => {
                let next = tokio::select! {
                    biased;
                    _ = writer.client_gone() => Err(StreamFailure::Cancelled(CancelReason::ClientDisconnected)),
                    next = deltas.next_delta() => next,
                };
                match next {
                    Ok(Some(delta)) => delta,
                    Ok(None) => {
                        writer.close();
                        break RelayOutcome::Completed;
                    }
                    Err(StreamFailure::Cancelled(CancelReason::Deadline)) => {
                        // Mid-stream timeout: the caller keeps the truncated text, no error frame.
                        writer.close();
                        break RelayOutcome::TimedOut;
                    }
                    Err(StreamFailure::Cancelled(CancelReason::ClientDisconnected)) => {
                        break RelayOutcome::ClientCancelled;
                    }
                    Err(failure @ StreamFailure::Upstream(_)) => {
                        deltas.abort();
                        let outcome = RelayOutcome::from(failure);
                        if let RelayOutcome::UpstreamError { message, .. } = &outcome {
                            writer.fail(message.clone()).await;
                        }
                        break outcome;
                    }
                }
            }
        };
        match writer.write(delta).await {
            Ok(()) => metrics::counter!("chat_relay_deltas_total").increment(1),
            Err(WriteError::Cancelled(CancelReason::Deadline)) => {
                // Blocked on a slow caller when the deadline fired.
                deltas.abort();
                writer.close();
                break RelayOutcome::TimedOut;
            }
            Err(
                WriteError::Disconnected
                | WriteError::Terminated
                | WriteError::Cancelled(CancelReason::ClientDisconnected),
            ) => {
                break RelayOutcome::ClientCancelled;
            }
        }
    };

    deltas.abort();
    drop(deadline);
    recorder.finish(&outcome, writer.deltas_written(), writer.bytes_written());
}

fn plain_text(body: axum::body::Body) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime::TEXT_PLAIN_UTF_8.as_ref())],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{UpstreamCallError, UpstreamErrorKind};

    #[test]
    fn upstream_failure_without_status_maps_to_500() {
        let failure = StreamFailure::Upstream(UpstreamCallError::new(
            UpstreamErrorKind::Network,
            None,
            "connection reset".to_string(),
        ));
        assert_eq!(
            RelayOutcome::from(failure),
            RelayOutcome::UpstreamError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "upstream_unreachable".to_string(),
                message: "connection reset".to_string(),
            }
        );
    }

    #[test]
    fn cancellation_origin_selects_outcome() {
        assert_eq!(
            RelayOutcome::from(StreamFailure::Cancelled(CancelReason::Deadline)),
            RelayOutcome::TimedOut
        );
        assert_eq!(
            RelayOutcome::from(StreamFailure::Cancelled(CancelReason::ClientDisconnected)),
            RelayOutcome::ClientCancelled
        );
    }

    #[test]
    fn timeout_before_streaming_is_gateway_timeout() {
        let resp = RelayOutcome::TimedOut.into_unstreamed_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn cancelled_before_streaming_is_no_content() {
        let resp = RelayOutcome::ClientCancelled.into_unstreamed_response();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn deadline_during_blocked_write_closes_upstream() {
        use bytes::Bytes;
        use futures_util::StreamExt;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());
        let frames: Vec<Result<Bytes, reqwest::Error>> = (0..10)
            .map(|n| {
                let chunk = serde_json::json!({
                    "choices": [{"index": 0, "delta": {"content": format!("d{n} ")}}]
                });
                Ok(Bytes::from(format!("data: {chunk}\n\n")))
            })
            .collect();
        let upstream = futures_util::stream::iter(frames)
            .chain(futures_util::stream::pending())
            .map(move |item| {
                let _keep = &guard;
                item
            });

        let cancel = CancelContext::new();
        let deltas = DeltaStream::from_byte_stream(upstream, cancel.clone());
        // Capacity 1 and an unread body: the second write blocks.
        let (writer, body) = StreamWriter::channel(cancel.clone(), 1);
        let deadline = cancel.arm_deadline(Duration::from_millis(20));
        let first = StreamDelta {
            text: "first".to_string(),
        };
        let task = tokio::spawn(pump(deltas, writer, first, deadline, OutcomeRecorder::new()));

        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("pump ends after the deadline")
            .unwrap();
        assert_eq!(cancel.reason(), Some(CancelReason::Deadline));
        assert!(dropped.load(Ordering::SeqCst));

        let bytes = http_body_util::BodyExt::collect(body)
            .await
            .expect("graceful close")
            .to_bytes();
        assert_eq!(bytes, Bytes::from("first"));
    }

    #[tokio::test]
    async fn pump_stops_at_deadline_and_keeps_partial_output() {
        use bytes::Bytes;
        use http_body_util::BodyExt;

        let cancel = CancelContext::new();
        let deltas = DeltaStream::from_byte_stream(
            futures_util::stream::pending::<Result<Bytes, reqwest::Error>>(),
            cancel.clone(),
        );
        let (writer, body) = StreamWriter::channel(cancel.clone(), 4);
        let deadline = cancel.arm_deadline(std::time::Duration::from_millis(20));
        let first = StreamDelta {
            text: "partial".to_string(),
        };
        let task = tokio::spawn(pump(deltas, writer, first, deadline, OutcomeRecorder::new()));

        let bytes = body.collect().await.expect("graceful close").to_bytes();
        assert_eq!(bytes, Bytes::from("partial"));
        task.await.unwrap();
        assert_eq!(cancel.reason(), Some(CancelReason::Deadline));
    }
}
