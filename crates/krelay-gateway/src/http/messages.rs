//! Messages-dialect endpoints: `POST /v1/messages` and
//! `POST /v1/messages/count_tokens`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::info;

use krelay_core::models::{parse_stream_mode, resolve};
use krelay_translate::anthropic::{
    self, error_body, event_content_block_start_text, event_content_block_stop, event_error,
    event_message_delta, event_message_start, event_message_stop, event_text_delta,
    events_tool_use, messages_response, MessagesRequest,
};
use krelay_translate::session::session_key;
use krelay_wire::decode::{EventStreamParser, StopReason};

use crate::app::AppState;
use crate::error::GatewayError;
use crate::http::{chunk_chars, sse_json, PSEUDO_CHUNK_CHARS, PSEUDO_CHUNK_DELAY_MS};
use crate::orchestrate::{self, DispatchOutcome, PreparedRequest};

const PATH: &str = "/v1/messages";
const PROTOCOL: &str = "anthropic";

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (status, Json(error_body(error_type, message))).into_response()
}

fn gateway_error_response(e: &GatewayError) -> Response {
    error_response(e.http_status(), e.error_type(), &e.to_string())
}

pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let request_id = state.new_request_id();

    let req: MessagesRequest = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("invalid request body: {e}"),
            )
        }
    };

    let (bare_model, pseudo) = parse_stream_mode(&req.model);
    let model = resolve(bare_model);
    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let key = session_key(&raw_messages);

    let translated = match anthropic::to_upstream(&req, model) {
        Ok(t) => t,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", &e.to_string())
        }
    };

    let prepared = PreparedRequest {
        translated,
        model: model.to_string(),
        session_key: key,
    };
    let input_chars = prepared.translated.user_content.len()
        + prepared
            .translated
            .history
            .iter()
            .map(krelay_wire::request::HistoryTurn::estimated_chars)
            .sum::<usize>();

    info!(model, stream = req.stream, pseudo, "messages request");

    if req.stream && !pseudo {
        return true_stream(state, prepared, request_id, started).await;
    }

    match orchestrate::dispatch_buffered(&state, &prepared).await {
        Ok(outcome) => {
            state.record_flow(
                &request_id,
                PROTOCOL,
                PATH,
                &prepared.model,
                Some(&outcome.account_id),
                200,
                started,
                None,
            );
            if req.stream {
                pseudo_stream(prepared.model.clone(), outcome, request_id)
            } else {
                let resp = messages_response(
                    &outcome.reply,
                    &prepared.model,
                    &format!("msg_{request_id}"),
                    input_chars,
                );
                (StatusCode::OK, Json(resp)).into_response()
            }
        }
        Err(e) => {
            state.record_flow(
                &request_id,
                PROTOCOL,
                PATH,
                &prepared.model,
                None,
                e.http_status().as_u16(),
                started,
                Some(e.to_string()),
            );
            gateway_error_response(&e)
        }
    }
}

/// Relay the upstream stream live. After the first downstream byte an
/// upstream failure terminates the stream with a dialect error event — no
/// re-dispatch.
async fn true_stream(
    state: Arc<AppState>,
    prepared: PreparedRequest,
    request_id: String,
    started: Instant,
) -> Response {
    let lease = match orchestrate::begin_stream(&state, &prepared).await {
        Ok(l) => l,
        Err(e) => {
            state.record_flow(
                &request_id,
                PROTOCOL,
                PATH,
                &prepared.model,
                None,
                e.http_status().as_u16(),
                started,
                Some(e.to_string()),
            );
            return gateway_error_response(&e);
        }
    };
    state.record_flow(
        &request_id,
        PROTOCOL,
        PATH,
        &prepared.model,
        Some(&lease.credential.id),
        200,
        started,
        None,
    );

    let model = prepared.model.clone();
    let message_id = format!("msg_{request_id}");
    let stream = async_stream::stream! {
        yield sse_json(event_message_start(&message_id, &model));
        yield sse_json(event_content_block_start_text());

        let mut parser = EventStreamParser::new();
        let mut text_chars = 0usize;
        let mut byte_stream = lease.response.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for text in parser.feed(&bytes) {
                        text_chars += text.len();
                        yield sse_json(event_text_delta(&text));
                    }
                }
                Err(e) => {
                    yield sse_json(event_error("api_error", &e.to_string()));
                    return;
                }
            }
        }

        yield sse_json(event_content_block_stop(0));
        let tools = parser.finish();
        let stop_reason = if tools.is_empty() { StopReason::EndTurn } else { StopReason::ToolUse };
        for (i, tool) in tools.iter().enumerate() {
            for event in events_tool_use(i + 1, tool) {
                yield sse_json(event);
            }
        }
        yield sse_json(event_message_delta(stop_reason, text_chars));
        yield sse_json(event_message_stop());
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Buffered reply re-emitted as the dialect's stream at a fixed cadence.
fn pseudo_stream(model: String, outcome: DispatchOutcome, request_id: String) -> Response {
    let message_id = format!("msg_{request_id}");
    let stream = async_stream::stream! {
        yield sse_json(event_message_start(&message_id, &model));
        yield sse_json(event_content_block_start_text());

        let text = outcome.reply.text();
        for chunk in chunk_chars(&text, PSEUDO_CHUNK_CHARS) {
            yield sse_json(event_text_delta(&chunk));
            tokio::time::sleep(Duration::from_millis(PSEUDO_CHUNK_DELAY_MS)).await;
        }

        yield sse_json(event_content_block_stop(0));
        for (i, tool) in outcome.reply.tool_uses.iter().enumerate() {
            for event in events_tool_use(i + 1, tool) {
                yield sse_json(event);
            }
        }
        yield sse_json(event_message_delta(outcome.reply.stop_reason, text.len()));
        yield sse_json(event_message_stop());
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Simple char/4 estimate over system and message text.
pub async fn handle_count_tokens(Json(body): Json<Value>) -> Response {
    let mut chars = 0usize;
    if let Some(system) = body.get("system").and_then(Value::as_str) {
        chars += system.len();
    }
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            match message.get("content") {
                Some(Value::String(s)) => chars += s.len(),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            chars += text.len();
                        }
                    }
                }
                _ => {}
            }
        }
    }
    let tokens = anthropic::estimate_tokens_from_chars(chars).max(1);
    Json(serde_json::json!({ "input_tokens": tokens })).into_response()
}
