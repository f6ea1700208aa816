//! On-disk token records and refresh.
//!
//! Each credential points at a JSON blob written by the provider's login
//! tooling. The file is re-read on every access so refreshes performed by
//! other processes are picked up, and refreshed tokens are written back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PoolError, Result};

const DEFAULT_REGION: &str = "us-east-1";

/// Raw token blob as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    #[serde(default)]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// RFC3339 expiry. Absent means "unknown", treated as not expiring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

impl TokenRecord {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// True when the token expires within `minutes` from now. Records
    /// without an expiry never report as expiring.
    pub fn expires_within(&self, minutes: i64) -> bool {
        match self.expires_at() {
            Some(at) => Utc::now() + Duration::minutes(minutes) >= at,
            None => false,
        }
    }

    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or(DEFAULT_REGION)
    }
}

/// Handle to one credential's token file.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: String,
}

impl TokenStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn load(&self) -> Result<TokenRecord> {
        let data = std::fs::read_to_string(&self.path)
            .map_err(|e| PoolError::Token(format!("cannot read {}: {e}", self.path)))?;
        serde_json::from_str(&data)
            .map_err(|e| PoolError::Token(format!("invalid token JSON in {}: {e}", self.path)))
    }

    pub fn save(&self, record: &TokenRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&self.path, json)
            .map_err(|e| PoolError::Token(format!("cannot write {}: {e}", self.path)))?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime of the new access token in seconds.
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

/// Exchange a refresh token at the provider's OIDC token endpoint.
/// Requires both `refresh_token` and `client_id` on the record.
pub async fn refresh(client: &reqwest::Client, current: &TokenRecord) -> Result<TokenRecord> {
    let refresh_token = current
        .refresh_token
        .as_deref()
        .ok_or_else(|| PoolError::Refresh("no refresh token on record".into()))?;
    let client_id = current
        .client_id
        .as_deref()
        .ok_or_else(|| PoolError::Refresh("no client id on record".into()))?;

    let url = format!("https://oidc.{}.amazonaws.com/token", current.region());
    let body = serde_json::json!({
        "clientId": client_id,
        "refreshToken": refresh_token,
        "grantType": "refresh_token",
    });

    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "token refresh rejected");
        return Err(PoolError::Refresh(format!("endpoint returned {status}: {text}")));
    }

    let refreshed: RefreshResponse = resp
        .json()
        .await
        .map_err(|e| PoolError::Refresh(format!("invalid refresh response: {e}")))?;

    let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in);
    debug!(expires_in = refreshed.expires_in, "access token refreshed");

    Ok(TokenRecord {
        access_token: refreshed.access_token,
        refresh_token: refreshed
            .refresh_token
            .or_else(|| current.refresh_token.clone()),
        expires_at: Some(expires_at.to_rfc3339()),
        auth_method: current.auth_method.clone(),
        region: current.region.clone(),
        client_id: current.client_id.clone(),
        profile_arn: current.profile_arn.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip_preserves_camel_case() {
        let record = TokenRecord {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some("2030-01-01T00:00:00+00:00".into()),
            auth_method: Some("social".into()),
            region: Some("eu-west-1".into()),
            client_id: Some("cid".into()),
            profile_arn: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"accessToken\""));
        assert!(json.contains("\"refreshToken\""));
        assert!(json.contains("\"expiresAt\""));
        let back: TokenRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_token, "at");
        assert_eq!(back.region(), "eu-west-1");
    }

    #[test]
    fn expiry_window() {
        let soon = TokenRecord {
            access_token: "at".into(),
            expires_at: Some((Utc::now() + Duration::minutes(5)).to_rfc3339()),
            ..Default::default()
        };
        assert!(soon.expires_within(15));
        assert!(!soon.expires_within(1));

        let unknown = TokenRecord {
            access_token: "at".into(),
            ..Default::default()
        };
        assert!(!unknown.expires_within(15));
    }

    #[test]
    fn store_load_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(
            &path,
            r#"{"accessToken":"abc","refreshToken":"r","region":"us-east-1"}"#,
        )
        .unwrap();

        let store = TokenStore::new(path.to_str().unwrap());
        let mut record = store.load().unwrap();
        assert_eq!(record.access_token, "abc");

        record.access_token = "new".into();
        store.save(&record).unwrap();
        assert_eq!(store.load().unwrap().access_token, "new");
    }
}
