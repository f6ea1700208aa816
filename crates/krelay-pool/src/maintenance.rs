//! Background maintainer.
//!
//! One long-lived task per process: pre-refreshes tokens nearing expiry,
//! probes credential health against the upstream model-list endpoint on a
//! slower cadence, and prunes idle affinity entries. Shuts down through a
//! `CancellationToken` handed in at spawn.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use krelay_core::config::{MODELS_URL, PROBE_TIMEOUT_SECS};

use crate::pool::CredentialPool;

pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(600);
/// Refresh tokens expiring within this many minutes.
const REFRESH_AHEAD_MINUTES: i64 = 15;

pub fn spawn(pool: Arc<CredentialPool>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(run(pool, cancel))
}

async fn run(pool: Arc<CredentialPool>, cancel: CancellationToken) {
    // TLS verification is intentionally off toward the upstream; the probe
    // client mirrors the dispatch client.
    let probe_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
        .build()
        .unwrap_or_default();

    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_health = tokio::time::Instant::now() - HEALTH_INTERVAL;

    info!("maintenance task started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("maintenance task stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        refresh_expiring_tokens(&pool).await;

        if last_health.elapsed() >= HEALTH_INTERVAL {
            health_check(&pool, &probe_client).await;
            last_health = tokio::time::Instant::now();
        }

        pool.affinity().prune();
    }
}

/// Pre-refresh every enabled credential whose token expires soon and which
/// has the material to refresh.
async fn refresh_expiring_tokens(pool: &Arc<CredentialPool>) {
    for snapshot in pool.snapshots() {
        if !snapshot.enabled {
            continue;
        }
        let Some(cred) = pool.get(&snapshot.id) else {
            continue;
        };
        if !cred.token_expiring_within(REFRESH_AHEAD_MINUTES) {
            continue;
        }
        let has_refresh = cred
            .tokens()
            .map(|t| t.refresh_token.is_some() && t.client_id.is_some())
            .unwrap_or(false);
        if !has_refresh {
            continue;
        }
        debug!(credential = %snapshot.id, "token nearing expiry, refreshing");
        if let Err(e) = pool.refresh_token(&snapshot.id).await {
            warn!(credential = %snapshot.id, error = %e, "scheduled refresh failed");
        }
    }
}

/// Lightweight probe against the model-list endpoint per enabled
/// credential. 200 recovers UNHEALTHY credentials; 401 demotes; a 429 says
/// nothing about health and leaves the status alone.
async fn health_check(pool: &Arc<CredentialPool>, client: &reqwest::Client) {
    for snapshot in pool.snapshots() {
        if !snapshot.enabled {
            continue;
        }
        let Some(cred) = pool.get(&snapshot.id) else {
            continue;
        };
        let Some(tokens) = cred.tokens() else {
            cred.mark_unhealthy();
            continue;
        };

        let result = client
            .get(MODELS_URL)
            .query(&[("origin", "AI_EDITOR")])
            .header("content-type", "application/json")
            .header("Authorization", format!("Bearer {}", tokens.access_token))
            .send()
            .await;

        match result {
            Ok(resp) => match resp.status().as_u16() {
                200 => {
                    if snapshot.status == crate::credential::CredentialStatus::Unhealthy {
                        info!(credential = %snapshot.id, "credential recovered");
                    }
                    cred.mark_healthy();
                }
                401 => {
                    warn!(credential = %snapshot.id, "probe rejected: auth failed");
                    cred.mark_unhealthy();
                }
                429 => {}
                other => {
                    debug!(credential = %snapshot.id, status = other, "probe inconclusive");
                }
            },
            Err(e) => {
                warn!(credential = %snapshot.id, error = %e, "health probe failed");
            }
        }
    }
}
