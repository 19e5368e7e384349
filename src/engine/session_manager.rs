// ── factgraph: Session Manager ──────────────────────────────────────────────
// In-memory registry of per-client sessions, owned by the serving layer.
// Idle sessions are evicted by an explicit `expire_idle` sweep; there is no
// background timer and no process-wide instance.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub type SessionId = String;

struct SessionEntry<T> {
    value: Arc<T>,
    last_seen: DateTime<Utc>,
}

pub struct SessionManager<T> {
    sessions: Mutex<HashMap<SessionId, SessionEntry<T>>>,
    ttl: Duration,
}

impl<T> SessionManager<T> {
    /// Sessions idle for longer than `ttl` are removed by `expire_idle`.
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: Mutex::new(HashMap::new()), ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create(&self, value: T) -> SessionId {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .insert(id.clone(), SessionEntry { value: Arc::new(value), last_seen: Utc::now() });
        debug!("[session] Opened {}", id);
        id
    }

    /// Look up a session and mark it as seen now.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(id)?;
        entry.last_seen = Utc::now();
        Some(entry.value.clone())
    }

    pub fn close(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            debug!("[session] Closed {}", id);
        }
        removed
    }

    /// Drop sessions whose last activity is older than `now - ttl`.
    /// Returns how many were removed.
    pub fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_seen >= cutoff);
        let expired = before - sessions.len();
        if expired > 0 {
            info!("[session] Expired {} idle sessions", expired);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_get_close() {
        let manager = SessionManager::new(Duration::minutes(5));
        let id = manager.create("client-a".to_string());
        assert_eq!(manager.get(&id).as_deref().map(String::as_str), Some("client-a"));
        assert_eq!(manager.len(), 1);
        assert!(manager.close(&id));
        assert!(!manager.close(&id));
        assert!(manager.get(&id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_expire_idle_removes_only_stale_sessions() {
        let manager = SessionManager::new(Duration::seconds(60));
        let a = manager.create(1u32);
        let b = manager.create(2u32);
        assert_eq!(manager.expire_idle(Utc::now() + Duration::seconds(30)), 0);
        assert_eq!(manager.len(), 2);

        assert_eq!(manager.expire_idle(Utc::now() + Duration::seconds(120)), 2);
        assert!(manager.get(&a).is_none());
        assert!(manager.get(&b).is_none());
    }

    #[test]
    fn test_get_refreshes_last_seen() {
        let manager = SessionManager::new(Duration::seconds(60));
        let id = manager.create(());
        manager.sessions.lock().get_mut(&id).unwrap().last_seen = Utc::now() - Duration::seconds(90);
        assert!(manager.get(&id).is_some());
        assert_eq!(manager.expire_idle(Utc::now()), 0);
        assert_eq!(manager.len(), 1);
    }
}
