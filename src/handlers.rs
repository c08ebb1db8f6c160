use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::normalize::{self, ClientMessage, NormalizeError};
use crate::relay;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;
use tracing::Instrument;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

/// `POST /api/chat`: validates and normalizes the conversation, then relays it upstream.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let messages = parse_messages(&body)?;
    let upstream_messages = normalize::normalize(&state.config.system_prompt, &messages)
        .map_err(|err| AppError::validation(err.to_string()))?;

    let span = tracing::info_span!(
        "relay",
        request_id = extract_request_id(&headers).as_deref().unwrap_or("-"),
        turns = upstream_messages.len(),
    );
    Ok(relay::start(&state, upstream_messages)
        .instrument(span)
        .await)
}

fn parse_messages(body: &[u8]) -> AppResult<Vec<ClientMessage>> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        AppError::validation(format!("request body must be a JSON object: {err}"))
    })?;
    let messages = value
        .get("messages")
        .ok_or_else(|| AppError::validation("messages is required"))?;
    let items = messages
        .as_array()
        .ok_or_else(|| AppError::validation("messages must be an array"))?;
    if items.is_empty() {
        return Err(AppError::validation(NormalizeError::Empty.to_string()));
    }
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            serde_json::from_value::<ClientMessage>(item.clone())
                .map_err(|err| AppError::validation(format!("messages[{idx}]: {err}")))
        })
        .collect()
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
