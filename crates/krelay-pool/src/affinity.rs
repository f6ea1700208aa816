//! Session affinity — sticky but advisory credential binding.
//!
//! Keys are content-derived session fingerprints; entries expire after a
//! fixed idle window and are pruned lazily on access plus periodically by
//! the maintainer.

use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const IDLE_WINDOW: Duration = Duration::from_secs(60);

struct AffinityEntry {
    credential_id: String,
    touched: Instant,
}

pub struct SessionAffinity {
    entries: DashMap<String, AffinityEntry>,
    ttl: Duration,
}

impl Default for SessionAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self::with_ttl(IDLE_WINDOW)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up the bound credential, refreshing the idle timer on a hit.
    /// Expired entries are removed rather than returned.
    pub fn get(&self, session_key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entry = self.entries.get_mut(session_key)?;
        if now.duration_since(entry.touched) > self.ttl {
            drop(entry);
            self.entries.remove(session_key);
            return None;
        }
        entry.touched = now;
        Some(entry.credential_id.clone())
    }

    pub fn bind(&self, session_key: &str, credential_id: &str) {
        self.entries.insert(
            session_key.to_string(),
            AffinityEntry {
                credential_id: credential_id.to_string(),
                touched: Instant::now(),
            },
        );
    }

    pub fn unbind(&self, session_key: &str) {
        self.entries.remove(session_key);
    }

    /// Drop all idle-expired entries. Called by the maintainer.
    pub fn prune(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, e| now.duration_since(e.touched) <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_get_refreshes_timer() {
        let affinity = SessionAffinity::new();
        affinity.bind("s1", "cred-a");
        assert_eq!(affinity.get("s1").as_deref(), Some("cred-a"));
        assert_eq!(affinity.get("missing"), None);
    }

    #[test]
    fn entries_expire_after_idle_window() {
        let affinity = SessionAffinity::with_ttl(Duration::from_millis(0));
        affinity.bind("s1", "cred-a");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(affinity.get("s1"), None);
        assert!(affinity.is_empty());
    }

    #[test]
    fn rebind_replaces_credential() {
        let affinity = SessionAffinity::new();
        affinity.bind("s1", "cred-a");
        affinity.bind("s1", "cred-b");
        assert_eq!(affinity.get("s1").as_deref(), Some("cred-b"));
    }

    #[test]
    fn prune_drops_only_idle_entries() {
        let affinity = SessionAffinity::with_ttl(Duration::from_secs(60));
        affinity.bind("fresh", "cred-a");
        affinity.prune();
        assert_eq!(affinity.len(), 1);
    }
}
