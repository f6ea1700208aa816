use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use krelay_core::config::ServiceConfig;
use krelay_pool::pool::CredentialPool;
use krelay_pool::rate_limit::RateLimiter;

use crate::flow::{FlowLog, FlowRecord, StatsRegistry};
use crate::upstream::UpstreamClient;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ServiceConfig,
    pub pool: Arc<CredentialPool>,
    pub limiter: RateLimiter,
    pub upstream: UpstreamClient,
    pub flows: FlowLog,
    pub stats: StatsRegistry,
}

impl AppState {
    pub fn new(config: ServiceConfig, pool: Arc<CredentialPool>) -> Self {
        let limiter = RateLimiter::new(config.limits.clone());
        Self {
            config,
            pool,
            limiter,
            upstream: UpstreamClient::new(),
            flows: FlowLog::new(),
            stats: StatsRegistry::new(),
        }
    }

    /// Short request id used in flow records and response ids.
    pub fn new_request_id(&self) -> String {
        Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    /// Emit one flow record and feed the stats registry.
    #[allow(clippy::too_many_arguments)]
    pub fn record_flow(
        &self,
        id: &str,
        protocol: &str,
        path: &str,
        model: &str,
        account_id: Option<&str>,
        status: u16,
        started: Instant,
        error: Option<String>,
    ) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(
            account_id.unwrap_or("unknown"),
            model,
            status == 200,
            duration_ms,
        );
        self.flows.push(FlowRecord {
            id: id.to_string(),
            timestamp: Utc::now(),
            protocol: protocol.to_string(),
            path: path.to_string(),
            model: model.to_string(),
            account_id: account_id.map(str::to_string),
            status,
            duration_ms,
            error,
        });
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/messages", post(crate::http::messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(crate::http::messages::handle_count_tokens),
        )
        .route(
            "/v1/chat/completions",
            post(crate::http::chat::handle_chat_completions),
        )
        .route("/v1/responses", post(crate::http::responses::handle_responses))
        .route("/v1/models", get(crate::http::models::handle_list_models))
        .route(
            "/v1/models/{model_action}",
            post(crate::http::gemini::handle_generate_content),
        )
        .route(
            "/v1beta/models/{model_action}",
            post(crate::http::gemini::handle_generate_content),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
