//! The credential pool: selection, failover, quota, persistence.
//!
//! The pool-wide lock only guards insert/delete of the credential list;
//! per-credential mutation goes through each credential's own mutex. No
//! lock is held across I/O or awaits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use krelay_core::config::{save_accounts, AccountEntry};

use crate::affinity::SessionAffinity;
use crate::credential::{Credential, CredentialSnapshot, QuotaRecord};
use crate::error::{PoolError, Result};
use crate::tokens;

pub struct CredentialPool {
    credentials: RwLock<Vec<Arc<Credential>>>,
    affinity: SessionAffinity,
    accounts_path: String,
    cooldown_secs: AtomicU64,
    http: reqwest::Client,
}

impl CredentialPool {
    pub fn new(entries: Vec<AccountEntry>, accounts_path: &str, cooldown_secs: u64) -> Self {
        let credentials = entries
            .into_iter()
            .map(|e| Arc::new(Credential::new(e.id, e.name, &e.token_path, e.enabled)))
            .collect();
        Self {
            credentials: RwLock::new(credentials),
            affinity: SessionAffinity::new(),
            accounts_path: accounts_path.to_string(),
            cooldown_secs: AtomicU64::new(cooldown_secs),
            http: reqwest::Client::new(),
        }
    }

    pub fn cooldown_secs(&self) -> u64 {
        self.cooldown_secs.load(Ordering::Relaxed)
    }

    pub fn set_cooldown_secs(&self, secs: u64) {
        self.cooldown_secs.store(secs, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> &SessionAffinity {
        &self.affinity
    }

    pub fn get(&self, id: &str) -> Option<Arc<Credential>> {
        self.credentials
            .read()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    fn list(&self) -> Vec<Arc<Credential>> {
        self.credentials.read().unwrap().clone()
    }

    pub fn snapshots(&self) -> Vec<CredentialSnapshot> {
        self.list().iter().map(|c| c.snapshot()).collect()
    }

    pub fn quota_records(&self) -> Vec<(String, QuotaRecord)> {
        self.list()
            .iter()
            .filter_map(|c| c.quota_record().map(|q| (c.id.clone(), q)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.read().unwrap().is_empty()
    }

    /// Pick the least-loaded available credential (earliest `last_used_at`
    /// breaks ties). With a session key, a live affinity binding wins as
    /// long as its credential is still available; otherwise the session is
    /// silently rebound to the fresh pick.
    pub fn select(&self, session_key: Option<&str>) -> Option<Arc<Credential>> {
        let now = Utc::now();

        if let Some(key) = session_key {
            if let Some(bound_id) = self.affinity.get(key) {
                if let Some(cred) = self.get(&bound_id) {
                    if cred.is_available(now) {
                        return Some(cred);
                    }
                }
            }
        }

        let picked = self.pick_available(now, None)?;
        if let Some(key) = session_key {
            self.affinity.bind(key, &picked.id);
        }
        Some(picked)
    }

    /// Failover pick: any available credential except `exclude_id`.
    pub fn next_available_excluding(&self, exclude_id: &str) -> Option<Arc<Credential>> {
        self.pick_available(Utc::now(), Some(exclude_id))
    }

    fn pick_available(
        &self,
        now: chrono::DateTime<Utc>,
        exclude_id: Option<&str>,
    ) -> Option<Arc<Credential>> {
        let mut best: Option<(u64, i64, Arc<Credential>)> = None;
        for cred in self.list() {
            if exclude_id == Some(cred.id.as_str()) {
                continue;
            }
            if !cred.is_available(now) {
                continue;
            }
            let load = cred.request_count();
            let used = cred
                .last_used_at()
                .map(|t| t.timestamp_millis())
                .unwrap_or(i64::MIN);
            let better = match &best {
                None => true,
                Some((best_load, best_used, _)) => {
                    load < *best_load || (load == *best_load && used < *best_used)
                }
            };
            if better {
                best = Some((load, used, cred));
            }
        }
        best.map(|(_, _, c)| c)
    }

    pub fn mark_quota_exceeded(&self, id: &str, reason: Option<String>) -> Result<()> {
        let cred = self.get(id).ok_or_else(|| PoolError::NotFound { id: id.into() })?;
        let cooldown = self.cooldown_secs();
        cred.mark_quota_exceeded(cooldown, reason);
        info!(credential = %id, cooldown_secs = cooldown, "credential entered quota cooldown");
        Ok(())
    }

    pub fn mark_suspended(&self, id: &str) -> Result<()> {
        let cred = self.get(id).ok_or_else(|| PoolError::NotFound { id: id.into() })?;
        cred.mark_suspended();
        warn!(credential = %id, "credential suspended by upstream signal");
        Ok(())
    }

    pub fn restore(&self, id: &str) -> Result<()> {
        let cred = self.get(id).ok_or_else(|| PoolError::NotFound { id: id.into() })?;
        cred.restore();
        info!(credential = %id, "credential restored");
        Ok(())
    }

    /// Exchange the refresh token for a new access token and persist it.
    /// Refreshes are serialized per credential; a concurrent attempt is a
    /// no-op. On failure the diagnostic is returned for logging; repeated
    /// failures flip the credential UNHEALTHY.
    pub async fn refresh_token(&self, id: &str) -> std::result::Result<(), String> {
        let cred = self
            .get(id)
            .ok_or_else(|| format!("credential not found: {id}"))?;

        if !cred.begin_refresh() {
            return Ok(()); // another task holds the refresh slot
        }

        let outcome = async {
            let record = cred
                .raw_record()
                .map_err(|e| format!("token record unreadable: {e}"))?;
            if record.refresh_token.is_none() || record.client_id.is_none() {
                return Err("record has no refresh token or client id".to_string());
            }
            let refreshed = tokens::refresh(&self.http, &record)
                .await
                .map_err(|e| e.to_string())?;
            cred.token_store()
                .save(&refreshed)
                .map_err(|e| format!("cannot persist refreshed token: {e}"))?;
            Ok(())
        }
        .await;

        cred.end_refresh(outcome.is_ok());
        match &outcome {
            Ok(()) => info!(credential = %id, "token refreshed"),
            Err(e) => warn!(credential = %id, error = %e, "token refresh failed"),
        }
        outcome
    }

    // ── admin-facing mutations (persisted) ───────────────────────────────

    pub fn add_account(&self, entry: AccountEntry) -> Result<()> {
        {
            let mut creds = self.credentials.write().unwrap();
            if creds.iter().any(|c| c.id == entry.id) {
                return Err(PoolError::Token(format!("duplicate credential id {}", entry.id)));
            }
            creds.push(Arc::new(Credential::new(
                entry.id,
                entry.name,
                &entry.token_path,
                entry.enabled,
            )));
        }
        self.persist()
    }

    pub fn remove_account(&self, id: &str) -> Result<()> {
        {
            let mut creds = self.credentials.write().unwrap();
            let before = creds.len();
            creds.retain(|c| c.id != id);
            if creds.len() == before {
                return Err(PoolError::NotFound { id: id.into() });
            }
        }
        self.persist()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let cred = self.get(id).ok_or_else(|| PoolError::NotFound { id: id.into() })?;
        cred.set_enabled(enabled);
        self.persist()
    }

    /// Rewrite the accounts file from the live pool.
    fn persist(&self) -> Result<()> {
        let entries: Vec<AccountEntry> = self
            .snapshots()
            .into_iter()
            .map(|s| AccountEntry {
                id: s.id,
                name: s.name,
                token_path: s.token_path,
                enabled: s.enabled,
            })
            .collect();
        save_accounts(&self.accounts_path, &entries).map_err(|e| PoolError::Token(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pool_with(tokens: &[(&str, &str)]) -> (CredentialPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut entries = Vec::new();
        for (id, token) in tokens {
            let path = dir.path().join(format!("{id}.json"));
            let mut f = std::fs::File::create(&path).unwrap();
            write!(f, r#"{{"accessToken":"{token}"}}"#).unwrap();
            entries.push(AccountEntry {
                id: id.to_string(),
                name: id.to_string(),
                token_path: path.to_str().unwrap().to_string(),
                enabled: true,
            });
        }
        let accounts = dir.path().join("accounts.json");
        let pool = CredentialPool::new(entries, accounts.to_str().unwrap(), 300);
        (pool, dir)
    }

    #[test]
    fn select_prefers_least_loaded() {
        let (pool, _dir) = pool_with(&[("a", "t"), ("b", "t")]);
        pool.get("a").unwrap().mark_used();
        pool.get("a").unwrap().mark_used();
        pool.get("b").unwrap().mark_used();
        let picked = pool.select(None).unwrap();
        assert_eq!(picked.id, "b");
    }

    #[test]
    fn affinity_sticks_even_when_less_loaded_exists() {
        let (pool, _dir) = pool_with(&[("a", "t"), ("b", "t")]);
        let first = pool.select(Some("sess")).unwrap();
        // Load the bound credential far beyond the other.
        for _ in 0..5 {
            first.mark_used();
        }
        let second = pool.select(Some("sess")).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn affinity_rebinds_when_bound_credential_unavailable() {
        let (pool, _dir) = pool_with(&[("a", "t"), ("b", "t")]);
        let first = pool.select(Some("sess")).unwrap();
        pool.mark_quota_exceeded(&first.id, Some("quota".into())).unwrap();
        let second = pool.select(Some("sess")).unwrap();
        assert_ne!(first.id, second.id);
        // The rebind is sticky in turn.
        let third = pool.select(Some("sess")).unwrap();
        assert_eq!(second.id, third.id);
    }

    #[test]
    fn exclusion_skips_named_credential() {
        let (pool, _dir) = pool_with(&[("a", "t"), ("b", "t")]);
        let other = pool.next_available_excluding("a").unwrap();
        assert_eq!(other.id, "b");
        let (single, _dir2) = pool_with(&[("only", "t")]);
        assert!(single.next_available_excluding("only").is_none());
    }

    #[test]
    fn quota_failover_end_to_end() {
        let (pool, _dir) = pool_with(&[("a", "t"), ("b", "t")]);
        pool.mark_quota_exceeded("a", Some("429".into())).unwrap();
        let picked = pool.select(None).unwrap();
        assert_eq!(picked.id, "b");
        let record = pool.get("a").unwrap().quota_record().unwrap();
        assert!(record.cooldown_until > Utc::now());
    }

    #[test]
    fn no_credentials_available_yields_none() {
        let (pool, _dir) = pool_with(&[("a", "t")]);
        pool.mark_suspended("a").unwrap();
        assert!(pool.select(None).is_none());
    }

    #[test]
    fn admin_mutations_persist_accounts_file() {
        let (pool, dir) = pool_with(&[("a", "t")]);
        let path = dir.path().join("extra.json");
        std::fs::write(&path, r#"{"accessToken":"t2"}"#).unwrap();
        pool.add_account(AccountEntry {
            id: "c".into(),
            name: "c".into(),
            token_path: path.to_str().unwrap().to_string(),
            enabled: true,
        })
        .unwrap();
        assert_eq!(pool.len(), 2);

        let saved = krelay_core::config::load_accounts(
            dir.path().join("accounts.json").to_str().unwrap(),
        )
        .unwrap();
        assert_eq!(saved.len(), 2);

        pool.remove_account("c").unwrap();
        assert_eq!(pool.len(), 1);
    }
}
