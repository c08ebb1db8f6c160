use crate::cancel::{CancelContext, CancelReason};
use crate::config::{UpstreamAuthConfig, UpstreamAuthType, UpstreamConfig};
use crate::normalize::UpstreamMessage;
use axum::http::StatusCode;
use bytes::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Protocol,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    /// Error code reported to the caller: the upstream's own code when it sent one.
    pub fn error_code(&self) -> String {
        if let Some(code) = &self.code {
            return code.clone();
        }
        match self.kind {
            UpstreamErrorKind::Network => "upstream_unreachable",
            UpstreamErrorKind::Http => "upstream_error",
            UpstreamErrorKind::Protocol => "upstream_protocol_error",
        }
        .to_string()
    }

    /// Status reported to the caller. Errors without an upstream status become a plain 500.
    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamFailure {
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamCallError),
    #[error("relay cancelled: {}", .0.as_str())]
    Cancelled(CancelReason),
}

/// One non-empty fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelta {
    pub text: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [UpstreamMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

/// Opens the streaming completion call. Both connecting and reading an error body race `cancel`,
/// so a deadline or disconnect drops the in-flight request instead of waiting it out.
pub async fn open_completion_stream(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    messages: &[UpstreamMessage],
    cancel: &CancelContext,
) -> Result<DeltaStream, StreamFailure> {
    let body = ChatCompletionRequest {
        model: &upstream.model,
        messages,
        stream: true,
        temperature: upstream.temperature,
        max_tokens: upstream.max_tokens,
    };
    let url = join_url(&upstream.base_url, CHAT_COMPLETIONS_PATH);
    let req = apply_auth(
        client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body),
        &upstream.auth,
    );

    let resp = tokio::select! {
        biased;
        reason = cancel.cancelled() => return Err(StreamFailure::Cancelled(reason)),
        resp = req.send() => resp.map_err(|err| {
            tracing::warn!(error = %err, "upstream request failed");
            UpstreamCallError::new(
                UpstreamErrorKind::Network,
                None,
                format!("upstream request failed: {}", err.without_url()),
            )
        })?,
    };

    let status = resp.status();
    if !status.is_success() {
        let text = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(StreamFailure::Cancelled(reason)),
            text = resp.text() => text.unwrap_or_default(),
        };
        let message = extract_error_message(&text).unwrap_or_else(|| {
            if text.trim().is_empty() {
                format!("upstream status {status}")
            } else {
                text.clone()
            }
        });
        let code = extract_error_code(&text);
        tracing::warn!(
            status = status.as_u16(),
            code = code.as_deref().unwrap_or("-"),
            message = %message,
            "upstream rejected completion request"
        );
        return Err(
            UpstreamCallError::new(UpstreamErrorKind::Http, Some(status), message)
                .with_code(code)
                .into(),
        );
    }

    tracing::debug!(model = %upstream.model, turns = messages.len(), "upstream stream opened");
    Ok(DeltaStream::from_byte_stream(
        resp.bytes_stream(),
        cancel.clone(),
    ))
}

type UpstreamEvents =
    Pin<Box<dyn Stream<Item = Result<Event, EventStreamError<reqwest::Error>>> + Send>>;

/// Single-pass sequence of deltas read from one upstream response.
///
/// The sequence cannot be restarted. Once `next_delta` has returned `Ok(None)` or an error, the
/// upstream body has been dropped and every later call returns `Ok(None)`.
pub struct DeltaStream {
    events: Option<UpstreamEvents>,
    cancel: CancelContext,
}

enum Polled {
    Cancelled(CancelReason),
    Event(Option<Result<Event, EventStreamError<reqwest::Error>>>),
}

impl DeltaStream {
    pub fn from_byte_stream<S>(bytes: S, cancel: CancelContext) -> Self
    where
        S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    {
        Self {
            events: Some(Box::pin(bytes.eventsource())),
            cancel,
        }
    }

    /// Drops the upstream body, closing the connection. Safe to call repeatedly.
    pub fn abort(&mut self) {
        if self.events.take().is_some() {
            tracing::debug!("upstream stream closed");
        }
    }

    pub async fn next_delta(&mut self) -> Result<Option<StreamDelta>, StreamFailure> {
        loop {
            let polled = {
                let Some(events) = self.events.as_mut() else {
                    return Ok(None);
                };
                tokio::select! {
                    biased;
                    reason = self.cancel.cancelled() => Polled::Cancelled(reason),
                    next = events.next() => Polled::Event(next),
                }
            };

            let event = match polled {
                Polled::Cancelled(reason) => {
                    self.abort();
                    return Err(StreamFailure::Cancelled(reason));
                }
                Polled::Event(None) => {
                    self.abort();
                    return Ok(None);
                }
                Polled::Event(Some(Err(err))) => {
                    self.abort();
                    return Err(UpstreamCallError::new(
                        UpstreamErrorKind::Network,
                        None,
                        format!("upstream stream interrupted: {err}"),
                    )
                    .into());
                }
                Polled::Event(Some(Ok(event))) => event,
            };

            let parsed = match parse_chunk(&event.data) {
                Ok(parsed) => parsed,
                Err(err) => {
                    self.abort();
                    return Err(err.into());
                }
            };
            if parsed.finished {
                self.abort();
            }
            if let Some(text) = parsed.delta {
                return Ok(Some(StreamDelta { text }));
            }
            if parsed.finished {
                return Ok(None);
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ParsedChunk {
    delta: Option<String>,
    finished: bool,
}

fn parse_chunk(data: &str) -> Result<ParsedChunk, UpstreamCallError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(ParsedChunk::default());
    }
    if data == "[DONE]" {
        return Ok(ParsedChunk {
            delta: None,
            finished: true,
        });
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|err| {
        UpstreamCallError::new(
            UpstreamErrorKind::Protocol,
            None,
            format!("malformed upstream chunk: {err}"),
        )
    })?;
    if let Some(error) = chunk.error {
        let status = error
            .code
            .as_ref()
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| (400..=599).contains(v))
            .and_then(|v| StatusCode::from_u16(v).ok());
        let code = error
            .code
            .as_ref()
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            status,
            error
                .message
                .unwrap_or_else(|| "upstream reported an error".to_string()),
        )
        .with_code(code));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(ParsedChunk::default());
    };
    Ok(ParsedChunk {
        delta: choice
            .delta
            .and_then(|d| d.content)
            .filter(|t| !t.is_empty()),
        finished: choice.finish_reason.is_some(),
    })
}

fn apply_auth(req: reqwest::RequestBuilder, auth: &UpstreamAuthConfig) -> reqwest::RequestBuilder {
    match auth.auth_type {
        UpstreamAuthType::Bearer => req.bearer_auth(&auth.value),
        UpstreamAuthType::Header => {
            let header_name = auth
                .header_name
                .clone()
                .unwrap_or_else(|| "x-api-key".to_string());
            req.header(header_name, &auth.value)
        }
        UpstreamAuthType::Query => {
            let query_name = auth
                .query_name
                .clone()
                .unwrap_or_else(|| "api_key".to_string());
            req.query(&[(query_name, auth.value.as_str())])
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error");
    error
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .or_else(|| error.and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
