//! generateContent endpoints:
//! `POST /v1/models/{model}:generateContent` and the `/v1beta` twin.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;
use tracing::info;

use krelay_core::models::{parse_stream_mode, resolve};
use krelay_translate::gemini::{self, error_body, generate_content_response, GenerateContentRequest};
use krelay_translate::session::session_key;

use crate::app::AppState;
use crate::error::GatewayError;
use crate::orchestrate::{self, PreparedRequest};

const PROTOCOL: &str = "gemini";

fn gateway_error_response(e: &GatewayError) -> Response {
    let status = e.http_status();
    (status, Json(error_body(status.as_u16(), &e.to_string()))).into_response()
}

/// The path segment arrives as `<model>:generateContent`; anything after
/// the colon other than generateContent is not served.
fn split_action(segment: &str) -> Option<(&str, &str)> {
    segment.split_once(':')
}

pub async fn handle_generate_content(
    State(state): State<Arc<AppState>>,
    Path(model_action): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let started = Instant::now();
    let request_id = state.new_request_id();

    let Some((inbound_model, action)) = split_action(&model_action) else {
        return (
            StatusCode::NOT_FOUND,
            Json(error_body(404, "expected {model}:generateContent")),
        )
            .into_response();
    };
    if action != "generateContent" {
        return (
            StatusCode::NOT_FOUND,
            Json(error_body(404, &format!("unsupported action: {action}"))),
        )
            .into_response();
    }

    let req: GenerateContentRequest = match serde_json::from_value(body.clone()) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(400, &format!("invalid request body: {e}"))),
            )
                .into_response()
        }
    };

    let (bare_model, _) = parse_stream_mode(inbound_model);
    let model = resolve(bare_model);
    let raw_contents = body
        .get("contents")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let key = session_key(&raw_contents);

    let translated = match gemini::to_upstream(&req, model) {
        Ok(t) => t,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_body(400, &e.to_string())),
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

    info!(model, inbound = inbound_model, "generateContent request");

    match orchestrate::dispatch_buffered(&state, &prepared).await {
        Ok(outcome) => {
            state.record_flow(
                &request_id,
                PROTOCOL,
                "/v1/models/:generateContent",
                &prepared.model,
                Some(&outcome.account_id),
                200,
                started,
                None,
            );
            let resp = generate_content_response(&outcome.reply, input_chars);
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => {
            state.record_flow(
                &request_id,
                PROTOCOL,
                "/v1/models/:generateContent",
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
