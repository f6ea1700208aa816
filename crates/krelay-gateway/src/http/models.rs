//! Model listing: `GET /v1/models`.
//!
//! Fetches the live upstream list when a credential can reach it, falls
//! back to the fixed set otherwise, and appends a pseudo-stream-prefixed
//! duplicate of every id so clients can opt into buffered streaming by
//! model name alone.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::debug;

use krelay_core::models::{fallback_model_ids, PSEUDO_STREAM_PREFIX};

use crate::app::AppState;

pub async fn handle_list_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut ids = Vec::new();
    if let Some(credential) = state.pool.select(None) {
        if let Some(tokens) = credential.tokens() {
            match state.upstream.fetch_models(&tokens.access_token).await {
                Ok(list) if !list.is_empty() => ids = list,
                Ok(_) => debug!("upstream model list empty, using fallback"),
                Err(e) => debug!(error = %e, "upstream model list fetch failed, using fallback"),
            }
        }
    }
    if ids.is_empty() {
        ids = fallback_model_ids();
    }

    let pseudo: Vec<String> = ids
        .iter()
        .map(|id| format!("{PSEUDO_STREAM_PREFIX}{id}"))
        .collect();
    ids.extend(pseudo);

    let data: Vec<serde_json::Value> = ids
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "owned_by": "krelay",
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data}))
}
