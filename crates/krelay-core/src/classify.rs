//! Upstream error classification.
//!
//! Maps an upstream (status, body) pair onto a small taxonomy carrying the
//! recovery decision as data. The orchestrator acts on the flags instead of
//! re-matching status codes at every call site.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccountSuspended,
    RateLimited,
    ContentTooLong,
    AuthFailed,
    ServiceUnavailable,
    ModelUnavailable,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccountSuspended => write!(f, "account-suspended"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::ContentTooLong => write!(f, "content-too-long"),
            Self::AuthFailed => write!(f, "auth-failed"),
            Self::ServiceUnavailable => write!(f, "service-unavailable"),
            Self::ModelUnavailable => write!(f, "model-unavailable"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classified upstream failure with recovery flags.
#[derive(Debug, Clone)]
pub struct ErrorDecision {
    pub kind: ErrorKind,
    /// Credential must be taken out of rotation until admin action.
    pub disable_account: bool,
    /// Worth rebinding the request to another credential.
    pub switch_account: bool,
    /// Worth re-dispatching on the same credential (possibly after shrink
    /// or backoff).
    pub retry_same: bool,
    /// Message suitable for the inbound dialect's error shape.
    pub user_message: String,
}

impl ErrorDecision {
    fn new(
        kind: ErrorKind,
        disable_account: bool,
        switch_account: bool,
        retry_same: bool,
        user_message: &str,
    ) -> Self {
        Self {
            kind,
            disable_account,
            switch_account,
            retry_same,
            user_message: user_message.to_string(),
        }
    }
}

/// Classify an upstream failure. `status == 0` means a transport-level
/// failure (timeout, connect error) with no HTTP response.
pub fn classify(status: u16, body: &str) -> ErrorDecision {
    let lower = body.to_lowercase();

    if status == 403 && (lower.contains("suspended") || lower.contains("blocked")) {
        return ErrorDecision::new(
            ErrorKind::AccountSuspended,
            true,
            true,
            false,
            "Account suspended by the upstream provider",
        );
    }

    if lower.contains("content_length_exceeds_threshold") || lower.contains("too long") {
        return ErrorDecision::new(
            ErrorKind::ContentTooLong,
            false,
            false,
            true,
            "Request content too long for the upstream model",
        );
    }

    if status == 429 || lower.contains("quota") || lower.contains("rate") {
        return ErrorDecision::new(
            ErrorKind::RateLimited,
            false,
            true,
            false,
            "Rate limited, please retry later",
        );
    }

    if status == 401 || lower.contains("invalid token") || lower.contains("unauthorized") {
        return ErrorDecision::new(
            ErrorKind::AuthFailed,
            false,
            true,
            false,
            "Upstream authentication failed",
        );
    }

    if lower.contains("model_temporarily_unavailable") || lower.contains("high load") {
        return ErrorDecision::new(
            ErrorKind::ModelUnavailable,
            false,
            true,
            true,
            "Model temporarily unavailable, please retry",
        );
    }

    if status == 0 || matches!(status, 500 | 502 | 503 | 504) {
        return ErrorDecision::new(
            ErrorKind::ServiceUnavailable,
            false,
            false,
            true,
            "Upstream service temporarily unavailable",
        );
    }

    ErrorDecision::new(
        ErrorKind::Unknown,
        false,
        false,
        false,
        "Upstream request failed",
    )
}

/// Whether a (status, body) pair signals quota exhaustion for the
/// credential that made the request.
pub fn is_quota_exceeded(status: u16, body: &str) -> bool {
    classify(status, body).kind == ErrorKind::RateLimited
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_disables_and_switches() {
        let d = classify(403, "Your account has been suspended");
        assert_eq!(d.kind, ErrorKind::AccountSuspended);
        assert!(d.disable_account);
        assert!(d.switch_account);
        assert!(!d.retry_same);
    }

    #[test]
    fn plain_403_is_not_suspension() {
        let d = classify(403, "forbidden");
        assert_eq!(d.kind, ErrorKind::Unknown);
        assert!(!d.disable_account);
    }

    #[test]
    fn rate_limit_by_status_and_body() {
        assert_eq!(classify(429, "").kind, ErrorKind::RateLimited);
        let d = classify(400, "monthly quota exceeded");
        assert_eq!(d.kind, ErrorKind::RateLimited);
        assert!(d.switch_account);
        assert!(!d.retry_same);
    }

    #[test]
    fn content_too_long_retries_same() {
        let d = classify(400, "Improperly formed request: content_length_exceeds_threshold");
        assert_eq!(d.kind, ErrorKind::ContentTooLong);
        assert!(d.retry_same);
        assert!(!d.switch_account);
    }

    #[test]
    fn content_length_wins_over_429() {
        // A 429 whose body names content length is a shrink problem, not a
        // quota problem.
        let d = classify(429, "content_length_exceeds_threshold");
        assert_eq!(d.kind, ErrorKind::ContentTooLong);
    }

    #[test]
    fn auth_failed() {
        assert_eq!(classify(401, "").kind, ErrorKind::AuthFailed);
        assert_eq!(classify(400, "invalid token supplied").kind, ErrorKind::AuthFailed);
    }

    #[test]
    fn server_errors_and_timeouts_retry_same() {
        for status in [500u16, 502, 503, 504] {
            let d = classify(status, "");
            assert_eq!(d.kind, ErrorKind::ServiceUnavailable);
            assert!(d.retry_same);
        }
        // Transport failure with no response.
        assert_eq!(classify(0, "connection reset").kind, ErrorKind::ServiceUnavailable);
    }

    #[test]
    fn model_unavailable_switches_and_retries() {
        let d = classify(400, "model_temporarily_unavailable due to high load");
        assert_eq!(d.kind, ErrorKind::ModelUnavailable);
        assert!(d.switch_account);
        assert!(d.retry_same);
    }

    #[test]
    fn unknown_surfaces() {
        let d = classify(418, "teapot");
        assert_eq!(d.kind, ErrorKind::Unknown);
        assert!(!d.retry_same);
        assert!(!d.switch_account);
    }
}
