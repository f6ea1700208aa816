//! Per-request flow records and aggregate statistics.
//!
//! Flow records are observability only — nothing in the dispatch path
//! reads them back. The admin surface consumes these snapshots.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Ring buffer capacity for recent flow records.
const FLOW_CAPACITY: usize = 1000;
/// Hourly counters older than this are dropped.
const HOURLY_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize)]
pub struct FlowRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Inbound dialect tag: "anthropic", "openai", "gemini".
    pub protocol: String,
    pub path: String,
    pub model: String,
    pub account_id: Option<String>,
    pub status: u16,
    pub duration_ms: f64,
    pub error: Option<String>,
}

pub struct FlowLog {
    records: Mutex<VecDeque<FlowRecord>>,
}

impl Default for FlowLog {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(FLOW_CAPACITY)),
        }
    }

    pub fn push(&self, record: FlowRecord) {
        let mut records = self.records.lock().unwrap();
        if records.len() == FLOW_CAPACITY {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<FlowRecord> {
        let records = self.records.lock().unwrap();
        records.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AccountStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ModelStats {
    pub total_requests: u64,
    pub total_errors: u64,
    total_latency_ms: f64,
}

impl ModelStats {
    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_latency_ms / self.total_requests as f64
    }
}

pub struct StatsRegistry {
    by_account: DashMap<String, AccountStats>,
    by_model: DashMap<String, ModelStats>,
    hourly: DashMap<i64, u64>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            by_account: DashMap::new(),
            by_model: DashMap::new(),
            hourly: DashMap::new(),
        }
    }

    pub fn record(&self, account_id: &str, model: &str, success: bool, latency_ms: f64) {
        {
            let mut account = self.by_account.entry(account_id.to_string()).or_default();
            account.total_requests += 1;
            if !success {
                account.total_errors += 1;
            }
            account.last_request_at = Some(Utc::now());
        }
        {
            let mut entry = self.by_model.entry(model.to_string()).or_default();
            entry.total_requests += 1;
            if !success {
                entry.total_errors += 1;
            }
            entry.total_latency_ms += latency_ms;
        }
        let hour = Utc::now().timestamp() / 3600;
        *self.hourly.entry(hour).or_insert(0) += 1;
        self.cleanup_hourly(hour);
    }

    fn cleanup_hourly(&self, current_hour: i64) {
        let cutoff = current_hour - HOURLY_WINDOW_HOURS;
        self.hourly.retain(|hour, _| *hour > cutoff);
    }

    pub fn account_stats(&self, account_id: &str) -> AccountStats {
        self.by_account
            .get(account_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn model_stats(&self, model: &str) -> ModelStats {
        self.by_model.get(model).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn requests_last_24h(&self) -> u64 {
        self.hourly.iter().map(|e| *e.value()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: u16) -> FlowRecord {
        FlowRecord {
            id: "r".into(),
            timestamp: Utc::now(),
            protocol: "openai".into(),
            path: "/v1/chat/completions".into(),
            model: "claude-sonnet-4".into(),
            account_id: Some("a".into()),
            status,
            duration_ms: 12.0,
            error: None,
        }
    }

    #[test]
    fn flow_log_is_bounded() {
        let log = FlowLog::new();
        for _ in 0..(FLOW_CAPACITY + 10) {
            log.push(record(200));
        }
        assert_eq!(log.len(), FLOW_CAPACITY);
    }

    #[test]
    fn recent_returns_newest_first() {
        let log = FlowLog::new();
        let mut first = record(200);
        first.id = "first".into();
        let mut second = record(200);
        second.id = "second".into();
        log.push(first);
        log.push(second);
        let recent = log.recent(1);
        assert_eq!(recent[0].id, "second");
    }

    #[test]
    fn stats_accumulate_per_account_and_model() {
        let stats = StatsRegistry::new();
        stats.record("a", "m", true, 100.0);
        stats.record("a", "m", false, 300.0);

        let account = stats.account_stats("a");
        assert_eq!(account.total_requests, 2);
        assert_eq!(account.total_errors, 1);

        let model = stats.model_stats("m");
        assert_eq!(model.total_requests, 2);
        assert!((model.avg_latency_ms() - 200.0).abs() < f64::EPSILON);

        assert_eq!(stats.requests_last_24h(), 2);
    }
}
