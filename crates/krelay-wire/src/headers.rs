//! Upstream request headers.
//!
//! The upstream authenticates with a bearer token and fingerprints callers
//! through an IDE-style user-agent carrying a per-credential machine id.
//! Header names are part of the wire contract and must not change.

use krelay_core::config::CLIENT_VERSION;
use uuid::Uuid;

/// Agent mode advertised to the upstream.
pub const AGENT_MODE: &str = "vibe";

/// Build the full header set for one upstream dispatch. The invocation id
/// is fresh per call.
pub fn build_headers(access_token: &str, machine_id: &str) -> Vec<(String, String)> {
    vec![
        ("content-type".into(), "application/json".into()),
        ("x-amzn-codewhisperer-optout".into(), "true".into()),
        ("x-amzn-kiro-agent-mode".into(), AGENT_MODE.into()),
        (
            "x-amz-user-agent".into(),
            format!("aws-sdk-js/1.0.27 KiroIDE-{}-{}", CLIENT_VERSION, machine_id),
        ),
        ("amz-sdk-invocation-id".into(), Uuid::new_v4().to_string()),
        ("amz-sdk-request".into(), "attempt=1; max=3".into()),
        ("Authorization".into(), format!("Bearer {}", access_token)),
    ]
}
