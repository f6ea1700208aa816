//! Chat-completions endpoint: `POST /v1/chat/completions`.

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
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::info;

use krelay_core::models::{parse_stream_mode, resolve};
use krelay_translate::openai::{
    self, chunk_error, chunk_finish, chunk_text, chunk_tool_calls, chat_response, error_body,
    ChatCompletionsRequest, DONE_SENTINEL,
};
use krelay_translate::session::session_key;
use krelay_wire::decode::{EventStreamParser, StopReason};

use crate::app::AppState;
use crate::error::GatewayError;
use crate::http::{chunk_chars, sse_json, sse_raw, PSEUDO_CHUNK_CHARS, PSEUDO_CHUNK_DELAY_MS};
use crate::orchestrate::{self, DispatchOutcome, PreparedRequest};

const PATH: &str = "/v1/chat/completions";
const PROTOCOL: &str = "openai";

fn error_response(status: StatusCode, message: &str, error_type: &str) -> Response {
    (status, Json(error_body(message, error_type))).into_response()
}

fn gateway_error_response(e: &GatewayError) -> Response {
    let error_type = match e {
        GatewayError::BadRequest(_) => "invalid_request_error",
        GatewayError::NoCredentials => "service_unavailable",
        _ => "api_error",
    };
    error_response(e.http_status(), &e.to_string(), error_type)
}

pub async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let request_id = state.new_request_id();

    let req: ChatCompletionsRequest = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                "invalid_request_error",
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

    let translated = match openai::to_upstream(&req, model) {
        Ok(t) => t,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &e.to_string(), "invalid_request_error")
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

    info!(model, stream = req.stream, pseudo, "chat completions request");

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
                let resp = chat_response(
                    &outcome.reply,
                    &prepared.model,
                    &format!("chatcmpl-{request_id}"),
                    Utc::now().timestamp(),
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
    let completion_id = format!("chatcmpl-{request_id}");
    let created = Utc::now().timestamp();
    let stream = async_stream::stream! {
        let mut parser = EventStreamParser::new();
        let mut byte_stream = lease.response.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for text in parser.feed(&bytes) {
                        yield sse_json(chunk_text(&completion_id, created, &model, &text));
                    }
                }
                Err(e) => {
                    yield sse_json(chunk_error(&completion_id, created, &model, &e.to_string()));
                    yield sse_raw(DONE_SENTINEL);
                    return;
                }
            }
        }

        let tools = parser.finish();
        if tools.is_empty() {
            yield sse_json(chunk_finish(&completion_id, created, &model, "stop"));
        } else {
            yield sse_json(chunk_tool_calls(&completion_id, created, &model, &tools));
            yield sse_json(chunk_finish(&completion_id, created, &model, "tool_calls"));
        }
        yield sse_raw(DONE_SENTINEL);
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn pseudo_stream(model: String, outcome: DispatchOutcome, request_id: String) -> Response {
    let completion_id = format!("chatcmpl-{request_id}");
    let created = Utc::now().timestamp();
    let stream = async_stream::stream! {
        let text = outcome.reply.text();
        for chunk in chunk_chars(&text, PSEUDO_CHUNK_CHARS) {
            yield sse_json(chunk_text(&completion_id, created, &model, &chunk));
            tokio::time::sleep(Duration::from_millis(PSEUDO_CHUNK_DELAY_MS)).await;
        }
        if outcome.reply.stop_reason == StopReason::ToolUse {
            yield sse_json(chunk_tool_calls(&completion_id, created, &model, &outcome.reply.tool_uses));
            yield sse_json(chunk_finish(&completion_id, created, &model, "tool_calls"));
        } else {
            yield sse_json(chunk_finish(&completion_id, created, &model, "stop"));
        }
        yield sse_raw(DONE_SENTINEL);
    };
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
