//! One upstream credential and its health/quota state machine.
//!
//! Mutable fields live behind a short-lived mutex so request workers and
//! the background maintainer never hold a lock across I/O. Token bytes are
//! not cached here — reads go through the `TokenStore` each time.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::tokens::{TokenRecord, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Cooldown,
    Unhealthy,
    Suspended,
    Disabled,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cooldown => write!(f, "cooldown"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Suspended => write!(f, "suspended"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Why and until when a credential is cooling down.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaRecord {
    pub exceeded_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Read-only token view handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub auth_method: Option<String>,
    pub region: String,
    pub client_id: Option<String>,
    pub profile_arn: Option<String>,
    pub machine_id: String,
}

#[derive(Debug)]
struct CredState {
    enabled: bool,
    status: CredentialStatus,
    request_count: u64,
    error_count: u64,
    last_used_at: Option<DateTime<Utc>>,
    quota: Option<QuotaRecord>,
    refresh_failures: u32,
    /// Serializes token refresh per credential.
    refreshing: bool,
}

/// Public snapshot for listings.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub id: String,
    pub name: String,
    pub token_path: String,
    pub enabled: bool,
    pub status: CredentialStatus,
    pub request_count: u64,
    pub error_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

pub struct Credential {
    pub id: String,
    pub name: String,
    store: TokenStore,
    machine_id: String,
    state: Mutex<CredState>,
}

impl Credential {
    pub fn new(id: impl Into<String>, name: impl Into<String>, token_path: &str, enabled: bool) -> Self {
        // Machine id is derived once from the token path and never changes:
        // the upstream fingerprints callers by it.
        let machine_id = hex::encode(Sha256::digest(token_path.as_bytes()));
        Self {
            id: id.into(),
            name: name.into(),
            store: TokenStore::new(token_path),
            machine_id,
            state: Mutex::new(CredState {
                enabled,
                status: CredentialStatus::Active,
                request_count: 0,
                error_count: 0,
                last_used_at: None,
                quota: None,
                refresh_failures: 0,
                refreshing: false,
            }),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.store
    }

    /// Availability: enabled, active, past any cooldown, and an access
    /// token on disk. An expired cooldown is promoted back to active here,
    /// so a credential becomes selectable exactly at `cooldown_until`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if !state.enabled {
                return false;
            }
            match state.status {
                CredentialStatus::Active => {}
                CredentialStatus::Cooldown => {
                    let expired = state
                        .quota
                        .as_ref()
                        .map_or(true, |q| now >= q.cooldown_until);
                    if !expired {
                        return false;
                    }
                    state.status = CredentialStatus::Active;
                    state.quota = None;
                }
                _ => return false,
            }
        }
        self.store
            .load()
            .map(|r| !r.access_token.is_empty())
            .unwrap_or(false)
    }

    /// Token view, or `None` when the record is unreadable or empty.
    pub fn tokens(&self) -> Option<Tokens> {
        let record = self.store.load().ok()?;
        if record.access_token.is_empty() {
            return None;
        }
        Some(Tokens {
            machine_id: self.machine_id.clone(),
            region: record.region().to_string(),
            access_token: record.access_token,
            refresh_token: record.refresh_token,
            expires_at: record
                .expires_at
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            auth_method: record.auth_method,
            client_id: record.client_id,
            profile_arn: record.profile_arn,
        })
    }

    pub fn raw_record(&self) -> crate::error::Result<TokenRecord> {
        self.store.load()
    }

    pub fn token_expiring_within(&self, minutes: i64) -> bool {
        self.store
            .load()
            .map(|r| r.expires_within(minutes))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> CredentialSnapshot {
        let state = self.state.lock().unwrap();
        CredentialSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            token_path: self.store.path().to_string(),
            enabled: state.enabled,
            status: state.status,
            request_count: state.request_count,
            error_count: state.error_count,
            last_used_at: state.last_used_at,
            cooldown_until: state.quota.as_ref().map(|q| q.cooldown_until),
        }
    }

    pub fn status(&self) -> CredentialStatus {
        self.state.lock().unwrap().status
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    pub fn request_count(&self) -> u64 {
        self.state.lock().unwrap().request_count
    }

    pub fn last_used_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_used_at
    }

    pub fn quota_record(&self) -> Option<QuotaRecord> {
        self.state.lock().unwrap().quota.clone()
    }

    /// Bookkeeping after a successful dispatch.
    pub fn mark_used(&self) {
        let mut state = self.state.lock().unwrap();
        state.request_count += 1;
        state.last_used_at = Some(Utc::now());
    }

    pub fn record_error(&self) {
        self.state.lock().unwrap().error_count += 1;
    }

    /// Enter cooldown after a quota signal. A second signal only ever
    /// pushes the deadline later, never earlier.
    pub fn mark_quota_exceeded(&self, cooldown_secs: u64, reason: Option<String>) {
        let now = Utc::now();
        let until = now + Duration::seconds(cooldown_secs as i64);
        let mut state = self.state.lock().unwrap();
        let until = match &state.quota {
            Some(existing) if existing.cooldown_until > until => existing.cooldown_until,
            _ => until,
        };
        state.status = CredentialStatus::Cooldown;
        state.quota = Some(QuotaRecord {
            exceeded_at: now,
            cooldown_until: until,
            reason,
        });
    }

    /// Terminal until admin restore.
    pub fn mark_suspended(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = CredentialStatus::Suspended;
    }

    pub fn mark_unhealthy(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status != CredentialStatus::Suspended {
            state.status = CredentialStatus::Unhealthy;
        }
    }

    /// Health probe succeeded: recover from UNHEALTHY only.
    pub fn mark_healthy(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == CredentialStatus::Unhealthy {
            state.status = CredentialStatus::Active;
        }
    }

    /// Admin restore: clears the quota record; reactivates unless
    /// suspended. A no-op on an already-active credential.
    pub fn restore(&self) {
        let mut state = self.state.lock().unwrap();
        state.quota = None;
        if state.status != CredentialStatus::Suspended {
            state.status = CredentialStatus::Active;
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().unwrap();
        state.enabled = enabled;
        state.status = if enabled {
            CredentialStatus::Active
        } else {
            CredentialStatus::Disabled
        };
    }

    /// Claim the per-credential refresh slot. Returns false when another
    /// task is already refreshing.
    pub(crate) fn begin_refresh(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.refreshing {
            return false;
        }
        state.refreshing = true;
        true
    }

    pub(crate) fn end_refresh(&self, ok: bool) {
        let mut state = self.state.lock().unwrap();
        state.refreshing = false;
        if ok {
            state.refresh_failures = 0;
        } else {
            state.refresh_failures += 1;
            // Repeated refresh failures take the credential out of rotation
            // until a health probe or admin action brings it back.
            if state.refresh_failures >= 3 && state.status != CredentialStatus::Suspended {
                state.status = CredentialStatus::Unhealthy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cred_with_token(token: &str) -> (Credential, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"accessToken":"{token}"}}"#).unwrap();
        let cred = Credential::new("c1", "one", path.to_str().unwrap(), true);
        (cred, dir)
    }

    #[test]
    fn availability_requires_token_and_active_status() {
        let (cred, _dir) = cred_with_token("tok");
        assert!(cred.is_available(Utc::now()));

        cred.mark_unhealthy();
        assert!(!cred.is_available(Utc::now()));
        cred.mark_healthy();
        assert!(cred.is_available(Utc::now()));

        cred.set_enabled(false);
        assert!(!cred.is_available(Utc::now()));
    }

    #[test]
    fn empty_token_is_unavailable() {
        let (cred, _dir) = cred_with_token("");
        assert!(!cred.is_available(Utc::now()));
        assert!(cred.tokens().is_none());
    }

    #[test]
    fn cooldown_expires_exactly_at_deadline() {
        let (cred, _dir) = cred_with_token("tok");
        cred.mark_quota_exceeded(300, Some("quota".into()));
        assert_eq!(cred.status(), CredentialStatus::Cooldown);

        let now = Utc::now();
        assert!(!cred.is_available(now));

        let deadline = cred.quota_record().unwrap().cooldown_until;
        // Exactly at the deadline the credential becomes selectable again.
        assert!(cred.is_available(deadline));
        assert_eq!(cred.status(), CredentialStatus::Active);
        assert!(cred.quota_record().is_none());
    }

    #[test]
    fn repeated_quota_keeps_later_deadline() {
        let (cred, _dir) = cred_with_token("tok");
        cred.mark_quota_exceeded(600, None);
        let first = cred.quota_record().unwrap().cooldown_until;
        cred.mark_quota_exceeded(60, None);
        let second = cred.quota_record().unwrap().cooldown_until;
        assert!(second >= first);
    }

    #[test]
    fn suspension_is_terminal_for_restore() {
        let (cred, _dir) = cred_with_token("tok");
        cred.mark_suspended();
        cred.restore();
        assert_eq!(cred.status(), CredentialStatus::Suspended);
    }

    #[test]
    fn restore_is_noop_when_active() {
        let (cred, _dir) = cred_with_token("tok");
        cred.restore();
        assert_eq!(cred.status(), CredentialStatus::Active);
    }

    #[test]
    fn machine_id_is_stable_per_path() {
        let a = Credential::new("a", "a", "/some/token.json", true);
        let b = Credential::new("b", "b", "/some/token.json", true);
        let c = Credential::new("c", "c", "/other/token.json", true);
        assert_eq!(a.machine_id(), b.machine_id());
        assert_ne!(a.machine_id(), c.machine_id());
        assert_eq!(a.machine_id().len(), 64);
    }

    #[test]
    fn refresh_slot_serializes() {
        let (cred, _dir) = cred_with_token("tok");
        assert!(cred.begin_refresh());
        assert!(!cred.begin_refresh());
        cred.end_refresh(true);
        assert!(cred.begin_refresh());
    }

    #[test]
    fn repeated_refresh_failures_mark_unhealthy() {
        let (cred, _dir) = cred_with_token("tok");
        for _ in 0..3 {
            assert!(cred.begin_refresh());
            cred.end_refresh(false);
        }
        assert_eq!(cred.status(), CredentialStatus::Unhealthy);
    }
}
