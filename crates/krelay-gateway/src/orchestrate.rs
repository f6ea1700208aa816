//! The request orchestrator.
//!
//! Per inbound request: select a credential (session-sticky), refresh its
//! token if it is about to expire, pace through the rate limiter, compact
//! history, dispatch upstream, and recover per the error classification —
//! switch credential, shrink history, back off, or surface. Buffered
//! dispatches retry freely; streaming dispatches may only fail over before
//! the first downstream byte.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use krelay_core::classify::{classify, ErrorKind};
use krelay_core::config::CompactionStrategy;
use krelay_pool::credential::Credential;
use krelay_translate::history::{self, HistoryManager};
use krelay_translate::TranslatedRequest;
use krelay_wire::decode::{decode_all, DecodedReply};
use krelay_wire::headers::build_headers;
use krelay_wire::request::{build_request, HistoryTurn, ToolResult, UpstreamRequest};

use crate::app::AppState;
use crate::error::GatewayError;

pub const MAX_RETRIES: usize = 2;
const BACKOFF_BASE_SECS: f64 = 0.5;
/// Refresh when the access token expires within this many minutes.
const REFRESH_AHEAD_MINUTES: i64 = 5;
/// Cap on consecutive rate-limit waits before dispatching anyway.
const MAX_RATE_WAITS: usize = 10;

/// A request after translation and model resolution, ready to orchestrate.
pub struct PreparedRequest {
    pub translated: TranslatedRequest,
    /// Resolved upstream model id.
    pub model: String,
    pub session_key: String,
}

pub struct DispatchOutcome {
    pub reply: DecodedReply,
    pub account_id: String,
}

/// A live upstream stream plus the credential serving it. The status has
/// already been verified as 200; bookkeeping is done.
pub struct StreamLease {
    pub response: reqwest::Response,
    pub credential: Arc<Credential>,
}

async fn backoff(retry: usize) {
    let secs = BACKOFF_BASE_SECS * 2f64.powi(retry as i32);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

fn snippet(body: &str) -> String {
    body.chars().take(100).collect()
}

/// Pre-dispatch work for one credential: opportunistic token refresh, then
/// rate pacing, then the header set.
async fn credential_headers(
    state: &AppState,
    credential: &Arc<Credential>,
) -> Result<Vec<(String, String)>, GatewayError> {
    if credential.token_expiring_within(REFRESH_AHEAD_MINUTES) {
        if let Err(e) = state.pool.refresh_token(&credential.id).await {
            debug!(credential = %credential.id, error = %e, "pre-dispatch refresh failed");
        }
    }
    let tokens = credential.tokens().ok_or_else(|| {
        GatewayError::Internal(format!("no usable token for credential {}", credential.id))
    })?;

    let mut waits = 0usize;
    loop {
        let decision = state.limiter.can_request(&credential.id);
        if decision.permitted {
            break;
        }
        waits += 1;
        if waits > MAX_RATE_WAITS {
            warn!(credential = %credential.id, "rate limiter kept denying, dispatching anyway");
            break;
        }
        debug!(
            credential = %credential.id,
            wait_secs = decision.wait_secs,
            reason = decision.reason.as_deref().unwrap_or(""),
            "rate limited, sleeping"
        );
        tokio::time::sleep(Duration::from_secs_f64(decision.wait_secs.max(0.05))).await;
    }

    Ok(build_headers(&tokens.access_token, credential.machine_id()))
}

fn record_success(state: &AppState, credential: &Arc<Credential>) {
    credential.mark_used();
    state.limiter.record_request(&credential.id);
}

/// Select a credential and compact history, running the pre-dispatch
/// summary pass when the strategy calls for one.
async fn prepare(
    state: &AppState,
    prepared: &PreparedRequest,
) -> Result<(Arc<Credential>, HistoryManager, Vec<HistoryTurn>, Vec<ToolResult>), GatewayError> {
    let credential = state
        .pool
        .select(Some(&prepared.session_key))
        .ok_or(GatewayError::NoCredentials)?;

    let mut manager = HistoryManager::new(state.config.history.clone());
    let trailing = prepared.translated.tool_results.clone().unwrap_or_default();
    let mut hist = history::repair(prepared.translated.history.clone(), &trailing);

    if manager.should_summarize(&hist, &prepared.translated.user_content) {
        if let Some(tokens) = credential.tokens() {
            let headers = build_headers(&tokens.access_token, credential.machine_id());
            let (head, tail) = manager.split_for_summary(hist.clone());
            if let Some(summary) = state
                .upstream
                .summarize(&history::transcript(&head), &headers)
                .await
            {
                let mut rebuilt = vec![history::summary_turn(&summary)];
                rebuilt.extend(tail);
                hist = history::repair(rebuilt, &trailing);
            }
        }
    }

    let hist = manager.pre_process(hist, &prepared.translated.user_content, &trailing);
    if manager.was_truncated {
        info!(session = %prepared.session_key, info = %manager.truncate_info, "history compacted");
    }
    Ok((credential, manager, hist, trailing))
}

fn assemble(prepared: &PreparedRequest, hist: &[HistoryTurn]) -> UpstreamRequest {
    build_request(
        prepared.translated.user_content.clone(),
        &prepared.model,
        hist.to_vec(),
        prepared.translated.tools.clone(),
        prepared.translated.tool_results.clone(),
        prepared.translated.images.clone(),
    )
}

/// Shrink history after a content-length rejection. With the
/// on-error-summary strategy the first attempt summarizes the head;
/// otherwise (or when summarization fails) oldest pairs are dropped.
async fn shrink_history(
    state: &AppState,
    manager: &mut HistoryManager,
    hist: Vec<HistoryTurn>,
    trailing: &[ToolResult],
    retry: usize,
    headers: &[(String, String)],
) -> (Vec<HistoryTurn>, bool) {
    if manager.strategy() == CompactionStrategy::SummarizeOnErrorOnly && retry == 0 && hist.len() >= 4 {
        let (head, tail) = manager.split_for_summary(hist.clone());
        if let Some(summary) = state
            .upstream
            .summarize(&history::transcript(&head), headers)
            .await
        {
            let mut rebuilt = vec![history::summary_turn(&summary)];
            rebuilt.extend(tail);
            return (history::repair(rebuilt, trailing), true);
        }
    }
    manager.handle_length_error(hist, retry)
}

/// Apply the pool-side consequences of a classified failure.
fn punish(state: &AppState, credential: &Arc<Credential>, kind: ErrorKind, disable: bool, body: &str) {
    credential.record_error();
    if disable {
        let _ = state.pool.mark_suspended(&credential.id);
    }
    match kind {
        ErrorKind::RateLimited => {
            let _ = state
                .pool
                .mark_quota_exceeded(&credential.id, Some(snippet(body)));
        }
        ErrorKind::AuthFailed => credential.mark_unhealthy(),
        _ => {}
    }
}

/// Buffered dispatch with the full retry-and-failover procedure.
pub async fn dispatch_buffered(
    state: &AppState,
    prepared: &PreparedRequest,
) -> Result<DispatchOutcome, GatewayError> {
    let (mut credential, mut manager, mut hist, trailing) = prepare(state, prepared).await?;

    let mut retry = 0usize;
    loop {
        let headers = match credential_headers(state, &credential).await {
            Ok(h) => h,
            Err(e) => {
                credential.mark_unhealthy();
                match state.pool.next_available_excluding(&credential.id) {
                    Some(next) if retry < MAX_RETRIES => {
                        retry += 1;
                        credential = next;
                        continue;
                    }
                    _ => return Err(e),
                }
            }
        };

        let request = assemble(prepared, &hist);
        match state.upstream.send_buffered(&request, &headers).await {
            Ok(reply) if reply.status == 200 => {
                record_success(state, &credential);
                return Ok(DispatchOutcome {
                    reply: decode_all(&reply.body),
                    account_id: credential.id.clone(),
                });
            }
            Ok(reply) => {
                let body = reply.body_text();
                let decision = classify(reply.status, &body);
                warn!(
                    status = reply.status,
                    kind = %decision.kind,
                    credential = %credential.id,
                    body = %snippet(&body),
                    "upstream rejected request"
                );
                punish(state, &credential, decision.kind, decision.disable_account, &body);
                let surface = GatewayError::Upstream {
                    status: reply.status,
                    kind: decision.kind,
                    message: decision.user_message.clone(),
                };

                if decision.kind == ErrorKind::ContentTooLong {
                    let (shorter, can_retry) =
                        shrink_history(state, &mut manager, hist, &trailing, retry, &headers).await;
                    hist = shorter;
                    if can_retry && retry < MAX_RETRIES {
                        info!(info = %manager.truncate_info, "retrying after shrink");
                        retry += 1;
                        continue;
                    }
                    return Err(surface);
                }

                if decision.switch_account && retry < MAX_RETRIES {
                    if let Some(next) = state.pool.next_available_excluding(&credential.id) {
                        info!(from = %credential.id, to = %next.id, "failing over to another credential");
                        state.pool.affinity().bind(&prepared.session_key, &next.id);
                        credential = next;
                        retry += 1;
                        continue;
                    }
                }

                if decision.retry_same && retry < MAX_RETRIES {
                    backoff(retry).await;
                    retry += 1;
                    continue;
                }

                return Err(surface);
            }
            Err(e) => {
                credential.record_error();
                warn!(credential = %credential.id, error = %e, "upstream transport failure");
                if retry < MAX_RETRIES {
                    backoff(retry).await;
                    retry += 1;
                    continue;
                }
                let status = if e.is_timeout() { 408 } else { 502 };
                return Err(GatewayError::Upstream {
                    status,
                    kind: ErrorKind::ServiceUnavailable,
                    message: "Upstream service temporarily unavailable".to_string(),
                });
            }
        }
    }
}

/// Open a true-stream dispatch. Failover and shrink retries run only until
/// a 200 arrives; once the lease is returned no re-dispatch happens.
pub async fn begin_stream(
    state: &AppState,
    prepared: &PreparedRequest,
) -> Result<StreamLease, GatewayError> {
    let (mut credential, mut manager, mut hist, trailing) = prepare(state, prepared).await?;

    let mut retry = 0usize;
    loop {
        let headers = match credential_headers(state, &credential).await {
            Ok(h) => h,
            Err(e) => {
                credential.mark_unhealthy();
                match state.pool.next_available_excluding(&credential.id) {
                    Some(next) if retry < MAX_RETRIES => {
                        retry += 1;
                        credential = next;
                        continue;
                    }
                    _ => return Err(e),
                }
            }
        };

        let request = assemble(prepared, &hist);
        let response = match state.upstream.send_stream(&request, &headers).await {
            Ok(r) => r,
            Err(e) => {
                credential.record_error();
                warn!(credential = %credential.id, error = %e, "stream dispatch failed");
                if retry < MAX_RETRIES {
                    backoff(retry).await;
                    retry += 1;
                    continue;
                }
                return Err(GatewayError::Upstream {
                    status: 502,
                    kind: ErrorKind::ServiceUnavailable,
                    message: "Upstream service temporarily unavailable".to_string(),
                });
            }
        };

        let status = response.status().as_u16();
        if status == 200 {
            record_success(state, &credential);
            return Ok(StreamLease {
                response,
                credential,
            });
        }

        // No downstream byte has been written yet, so the failure handling
        // mirrors the buffered path.
        let body = response.text().await.unwrap_or_default();
        let decision = classify(status, &body);
        warn!(status, kind = %decision.kind, credential = %credential.id, "stream dispatch rejected");
        punish(state, &credential, decision.kind, decision.disable_account, &body);
        let surface = GatewayError::Upstream {
            status,
            kind: decision.kind,
            message: decision.user_message.clone(),
        };

        if decision.kind == ErrorKind::ContentTooLong {
            let (shorter, can_retry) =
                shrink_history(state, &mut manager, hist, &trailing, retry, &headers).await;
            hist = shorter;
            if can_retry && retry < MAX_RETRIES {
                retry += 1;
                continue;
            }
            return Err(surface);
        }

        if decision.switch_account && retry < MAX_RETRIES {
            if let Some(next) = state.pool.next_available_excluding(&credential.id) {
                state.pool.affinity().bind(&prepared.session_key, &next.id);
                credential = next;
                retry += 1;
                continue;
            }
        }

        if decision.retry_same && retry < MAX_RETRIES {
            backoff(retry).await;
            retry += 1;
            continue;
        }

        return Err(surface);
    }
}
