//! Responses-variant endpoint: `POST /v1/responses`.
//!
//! Reduces the responses input to chat semantics, dispatches buffered, and
//! replies either with a completed response object or the variant's SSE
//! event triple (created / output_text deltas / completed).

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
use serde_json::{json, Value};
use tracing::info;

use krelay_core::models::{parse_stream_mode, resolve};
use krelay_translate::openai::{self, error_body, responses_response, ResponsesRequest};
use krelay_translate::session::session_key;

use crate::app::AppState;
use crate::error::GatewayError;
use crate::http::{chunk_chars, sse_json, PSEUDO_CHUNK_CHARS, PSEUDO_CHUNK_DELAY_MS};
use crate::orchestrate::{self, PreparedRequest};

const PATH: &str = "/v1/responses";
const PROTOCOL: &str = "openai";

fn gateway_error_response(e: &GatewayError) -> Response {
    (e.http_status(), Json(error_body(&e.to_string(), "api_error"))).into_response()
}

pub async fn handle_responses(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let request_id = state.new_request_id();

    let req: ResponsesRequest = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(
                    &format!("invalid request body: {e}"),
                    "invalid_request_error",
                )),
            )
                .into_response()
        }
    };

    let (bare_model, _) = parse_stream_mode(&req.model);
    let model = resolve(bare_model);
    // The input value doubles as the affinity fingerprint.
    let key = match &req.input {
        Value::Array(items) => session_key(items),
        other => session_key(std::slice::from_ref(other)),
    };

    let translated = match openai::responses_to_upstream(&req, model) {
        Ok(t) => t,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(&e.to_string(), "invalid_request_error")),
            )
                .into_response()
        }
    };

    let prepared = PreparedRequest {
        translated,
        model: model.to_string(),
        session_key: key,
    };
    let input_chars = prepared.translated.user_content.len();

    info!(model, stream = req.stream, "responses request");

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
            let response_id = format!("resp_{request_id}");
            let created = Utc::now().timestamp();
            if req.stream {
                let model = prepared.model.clone();
                let completed =
                    responses_response(&outcome.reply, &model, &response_id, created, input_chars);
                let stream = async_stream::stream! {
                    yield sse_json(json!({
                        "type": "response.created",
                        "response": {"id": response_id, "object": "response", "status": "in_progress"},
                    }));
                    let text = outcome.reply.text();
                    for chunk in chunk_chars(&text, PSEUDO_CHUNK_CHARS) {
                        yield sse_json(json!({
                            "type": "response.output_text.delta",
                            "delta": chunk,
                        }));
                        tokio::time::sleep(Duration::from_millis(PSEUDO_CHUNK_DELAY_MS)).await;
                    }
                    yield sse_json(json!({
                        "type": "response.completed",
                        "response": completed,
                    }));
                };
                Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
            } else {
                let resp = responses_response(
                    &outcome.reply,
                    &prepared.model,
                    &response_id,
                    created,
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
