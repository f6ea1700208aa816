//! Request pacing.
//!
//! Three knobs: a minimum gap between requests on one credential, a
//! per-credential per-minute cap, and a global per-minute cap. The
//! orchestrator sleeps on a denial and re-checks; nothing here blocks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use krelay_core::config::RateLimitSettings;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub permitted: bool,
    /// Suggested sleep before re-checking, when denied.
    pub wait_secs: f64,
    pub reason: Option<String>,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            permitted: true,
            wait_secs: 0.0,
            reason: None,
        }
    }

    fn deny(wait_secs: f64, reason: String) -> Self {
        Self {
            permitted: false,
            wait_secs,
            reason: Some(reason),
        }
    }
}

#[derive(Default)]
struct AccountWindow {
    last_request: Option<Instant>,
    requests: VecDeque<Instant>,
}

pub struct RateLimiter {
    settings: Mutex<RateLimitSettings>,
    accounts: DashMap<String, AccountWindow>,
    global: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            accounts: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
        }
    }

    /// Replace the limits at runtime.
    pub fn update(&self, settings: RateLimitSettings) {
        *self.settings.lock().unwrap() = settings;
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings.lock().unwrap().clone()
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant) {
        while window.front().is_some_and(|t| now.duration_since(*t) > WINDOW) {
            window.pop_front();
        }
    }

    /// Check whether `credential_id` may dispatch now.
    pub fn can_request(&self, credential_id: &str) -> RateDecision {
        let settings = self.settings.lock().unwrap().clone();
        let now = Instant::now();

        {
            let mut entry = self.accounts.entry(credential_id.to_string()).or_default();
            Self::prune(&mut entry.requests, now);

            if settings.min_request_interval_secs > 0.0 {
                if let Some(last) = entry.last_request {
                    let elapsed = now.duration_since(last).as_secs_f64();
                    if elapsed < settings.min_request_interval_secs {
                        let wait = settings.min_request_interval_secs - elapsed;
                        return RateDecision::deny(
                            wait,
                            format!("minimum interval on credential {credential_id}"),
                        );
                    }
                }
            }

            if settings.account_requests_per_minute > 0
                && entry.requests.len() >= settings.account_requests_per_minute as usize
            {
                let wait = entry
                    .requests
                    .front()
                    .map(|t| WINDOW.as_secs_f64() - now.duration_since(*t).as_secs_f64())
                    .unwrap_or(1.0)
                    .max(0.1);
                return RateDecision::deny(
                    wait,
                    format!("per-minute cap on credential {credential_id}"),
                );
            }
        }

        let mut global = self.global.lock().unwrap();
        Self::prune(&mut global, now);
        if settings.global_requests_per_minute > 0
            && global.len() >= settings.global_requests_per_minute as usize
        {
            let wait = global
                .front()
                .map(|t| WINDOW.as_secs_f64() - now.duration_since(*t).as_secs_f64())
                .unwrap_or(1.0)
                .max(0.1);
            return RateDecision::deny(wait, "global per-minute cap".to_string());
        }

        RateDecision::allow()
    }

    /// Record a successful dispatch on `credential_id`.
    pub fn record_request(&self, credential_id: &str) {
        let now = Instant::now();
        {
            let mut entry = self.accounts.entry(credential_id.to_string()).or_default();
            entry.last_request = Some(now);
            entry.requests.push_back(now);
            Self::prune(&mut entry.requests, now);
        }
        let mut global = self.global.lock().unwrap();
        global.push_back(now);
        Self::prune(&mut global, now);
    }
}
