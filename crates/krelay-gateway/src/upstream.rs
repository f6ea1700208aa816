//! HTTP client for the upstream assistant endpoint.
//!
//! One client per timeout class: long for streaming dispatches, shorter
//! for buffered ones, short for model-list probes. TLS verification is
//! disabled toward the upstream, matching the observed service behavior.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use krelay_core::config::{
    ASSISTANT_URL, BUFFERED_TIMEOUT_SECS, MODELS_URL, PROBE_TIMEOUT_SECS, STREAM_TIMEOUT_SECS,
};
use krelay_core::models::SUMMARY_MODEL;
use krelay_wire::decode::decode_all;
use krelay_wire::request::{build_request, UpstreamRequest};

/// A buffered upstream reply: status plus the raw event-stream body.
#[derive(Debug)]
pub struct BufferedReply {
    pub status: u16,
    pub body: Vec<u8>,
}

impl BufferedReply {
    /// Body as text, for error classification.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct UpstreamClient {
    stream_client: reqwest::Client,
    buffered_client: reqwest::Client,
    probe_client: reqwest::Client,
}

fn insecure_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            stream_client: insecure_client(Duration::from_secs(STREAM_TIMEOUT_SECS)),
            buffered_client: insecure_client(Duration::from_secs(BUFFERED_TIMEOUT_SECS)),
            probe_client: insecure_client(Duration::from_secs(PROBE_TIMEOUT_SECS)),
        }
    }

    fn apply_headers(
        mut builder: reqwest::RequestBuilder,
        headers: &[(String, String)],
    ) -> reqwest::RequestBuilder {
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }

    /// Dispatch and buffer the entire reply body.
    pub async fn send_buffered(
        &self,
        request: &UpstreamRequest,
        headers: &[(String, String)],
    ) -> Result<BufferedReply, reqwest::Error> {
        let builder = self.buffered_client.post(ASSISTANT_URL).json(request);
        let resp = Self::apply_headers(builder, headers).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        debug!(status, bytes = body.len(), "buffered upstream reply");
        Ok(BufferedReply { status, body })
    }

    /// Dispatch for live relaying; the caller inspects the status and
    /// consumes `bytes_stream()`.
    pub async fn send_stream(
        &self,
        request: &UpstreamRequest,
        headers: &[(String, String)],
    ) -> Result<reqwest::Response, reqwest::Error> {
        let builder = self.stream_client.post(ASSISTANT_URL).json(request);
        Self::apply_headers(builder, headers).send().await
    }

    /// Fetch the upstream model list with one credential's token.
    pub async fn fetch_models(&self, access_token: &str) -> Result<Vec<String>, reqwest::Error> {
        let resp = self
            .probe_client
            .get(MODELS_URL)
            .query(&[("origin", "AI_EDITOR")])
            .header("content-type", "application/json")
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "model list fetch rejected");
            return Ok(Vec::new());
        }
        let body: Value = resp.json().await?;
        Ok(parse_model_list(&body))
    }

    /// Summarize a transcript with the fast model. Failures degrade to
    /// `None`; the caller falls back to truncation.
    pub async fn summarize(
        &self,
        transcript: &str,
        headers: &[(String, String)],
    ) -> Option<String> {
        let prompt = format!(
            "Summarize the following conversation in a compact paragraph, \
             keeping facts, decisions, and open tasks:\n\n{transcript}"
        );
        let request = build_request(prompt, SUMMARY_MODEL, Vec::new(), None, None, None);
        match self.send_buffered(&request, headers).await {
            Ok(reply) if reply.status == 200 => {
                let text = decode_all(&reply.body).text();
                (!text.is_empty()).then_some(text)
            }
            Ok(reply) => {
                warn!(status = reply.status, "summary call rejected");
                None
            }
            Err(e) => {
                warn!(error = %e, "summary call failed");
                None
            }
        }
    }
}

/// Accept the handful of list shapes the endpoint has been seen to return.
fn parse_model_list(body: &Value) -> Vec<String> {
    let items = body
        .get("models")
        .and_then(Value::as_array)
        .or_else(|| body.as_array())
        .cloned()
        .unwrap_or_default();
    items
        .iter()
        .filter_map(|item| {
            if let Some(s) = item.as_str() {
                return Some(s.to_string());
            }
            item.get("modelId")
                .or_else(|| item.get("modelName"))
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_list_shapes() {
        let nested = serde_json::json!({"models": [{"modelId": "claude-sonnet-4"}, {"modelId": "auto"}]});
        assert_eq!(parse_model_list(&nested), vec!["claude-sonnet-4", "auto"]);

        let flat = serde_json::json!(["a", "b"]);
        assert_eq!(parse_model_list(&flat), vec!["a", "b"]);

        let empty = serde_json::json!({});
        assert!(parse_model_list(&empty).is_empty());
    }
}
