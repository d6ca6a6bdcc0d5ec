//! In-enclave session cache.
//!
//! Maps a random session id to its 32-byte AEAD key and absolute expiry.
//! Keys live in [`Zeroizing`] buffers, so any removal (sweep, explicit
//! delete, process exit) wipes the key bytes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::KEY_SIZE;

/// Default session lifetime.
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

struct SessionEntry {
    key: Zeroizing<[u8; KEY_SIZE]>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, id: String, key: Zeroizing<[u8; KEY_SIZE]>, expires_at: DateTime<Utc>) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.insert(id, SessionEntry { key, expires_at });
    }

    /// Returns a copy of the key and the expiry, or `None` when the id is
    /// absent or the entry has expired (`now >= expires_at`). Expired
    /// entries are left in place for the sweeper.
    pub fn get(&self, id: &str) -> Option<(Zeroizing<[u8; KEY_SIZE]>, DateTime<Utc>)> {
        self.get_at(id, Utc::now())
    }

    fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<(Zeroizing<[u8; KEY_SIZE]>, DateTime<Utc>)> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        let entry = sessions.get(id)?;
        if now >= entry.expires_at {
            return None;
        }
        Some((entry.key.clone(), entry.expires_at))
    }

    /// Removes a session; the key is wiped as the entry drops.
    pub fn delete(&self, id: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.remove(id);
    }

    /// Removes every entry with `expires_at <= now`, returning how many
    /// were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawns the periodic sweeper for expired sessions.
pub fn start_sweeper(store: Arc<SessionStore>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                debug!(removed, remaining = store.len(), "swept expired sessions");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key(byte: u8) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new([byte; KEY_SIZE])
    }

    #[test]
    fn store_then_get() {
        let store = SessionStore::new();
        let expires = Utc::now() + ChronoDuration::minutes(60);
        store.store("sid".into(), key(7), expires);

        let (k, e) = store.get("sid").unwrap();
        assert_eq!(*k, [7u8; KEY_SIZE]);
        assert_eq!(e, expires);
    }

    #[test]
    fn absent_id_is_none() {
        let store = SessionStore::new();
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn expired_get_is_none_but_entry_remains() {
        let store = SessionStore::new();
        let expires = Utc::now() - ChronoDuration::seconds(1);
        store.store("sid".into(), key(1), expires);

        assert!(store.get("sid").is_none());
        // Only the sweeper removes entries.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn boundary_instant_counts_as_expired() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.store("sid".into(), key(1), now);
        assert!(store.get_at("sid", now).is_none());
    }

    #[test]
    fn just_before_expiry_is_some() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.store("sid".into(), key(1), now + ChronoDuration::milliseconds(1));
        assert!(store.get_at("sid", now).is_some());
    }

    #[test]
    fn delete_removes() {
        let store = SessionStore::new();
        store.store("sid".into(), key(1), Utc::now() + ChronoDuration::minutes(5));
        store.delete("sid");
        assert!(store.get("sid").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = SessionStore::new();
        let now = Utc::now();
        store.store("dead".into(), key(1), now - ChronoDuration::seconds(10));
        store.store("edge".into(), key(2), now);
        store.store("live".into(), key(3), now + ChronoDuration::minutes(5));

        assert_eq!(store.sweep_at(now), 2);
        assert!(store.get("live").is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn store_overwrites_same_id() {
        let store = SessionStore::new();
        let expires = Utc::now() + ChronoDuration::minutes(5);
        store.store("sid".into(), key(1), expires);
        store.store("sid".into(), key(2), expires);
        let (k, _) = store.get("sid").unwrap();
        assert_eq!(*k, [2u8; KEY_SIZE]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_store_and_get() {
        let store = Arc::new(SessionStore::new());
        let expires = Utc::now() + ChronoDuration::minutes(5);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let id = format!("sid-{i}");
                store.store(id.clone(), key(i), expires);
                let (k, _) = store.get(&id).unwrap();
                assert_eq!(*k, [i; KEY_SIZE]);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
