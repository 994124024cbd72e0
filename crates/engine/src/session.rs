//! Bounded cache of search sessions.
//!
//! Multi-pass queries (grouping continuations, second-phase docsum
//! fetches) park state here between round trips. The cache is bounded,
//! entries expire by idle age, and the session-cache-prune maintenance
//! job sweeps it periodically.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct SessionEntry {
    last_used: Instant,
}

struct Inner {
    sessions: HashMap<String, SessionEntry>,
    closed: bool,
}

/// Bounded, expiring session cache.
pub struct SessionManager {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl SessionManager {
    /// A cache bounded to `max_entries`.
    pub fn new(max_entries: usize) -> Self {
        SessionManager {
            inner: Mutex::new(Inner {
                sessions: HashMap::new(),
                closed: false,
            }),
            max_entries,
        }
    }

    /// Insert (or refresh) a session. Returns false when the cache is
    /// closed or full.
    pub fn insert(&self, session_id: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        let session_id = session_id.into();
        if !inner.sessions.contains_key(&session_id) && inner.sessions.len() >= self.max_entries {
            return false;
        }
        inner.sessions.insert(
            session_id,
            SessionEntry {
                last_used: Instant::now(),
            },
        );
        true
    }

    /// Refresh a session's idle clock. Returns false when absent.
    pub fn touch(&self, session_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.get_mut(session_id) {
            Some(entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// True when no sessions are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    /// Drop sessions idle longer than `max_age`; returns how many went.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.sessions.len();
        let now = Instant::now();
        inner
            .sessions
            .retain(|_, entry| now.duration_since(entry.last_used) <= max_age);
        let pruned = before - inner.sessions.len();
        if pruned > 0 {
            debug!(pruned, "pruned idle sessions");
        }
        pruned
    }

    /// Drop everything and refuse new sessions.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_bound() {
        let manager = SessionManager::new(2);
        assert!(manager.insert("a"));
        assert!(manager.insert("b"));
        assert!(!manager.insert("c"));
        // Refreshing an existing session is always allowed.
        assert!(manager.insert("a"));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_prune_by_idle_age() {
        let manager = SessionManager::new(10);
        manager.insert("a");
        manager.insert("b");
        std::thread::sleep(Duration::from_millis(20));
        manager.touch("b");
        let pruned = manager.prune(Duration::from_millis(10));
        assert_eq!(pruned, 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.touch("b"));
    }

    #[test]
    fn test_close_refuses_inserts() {
        let manager = SessionManager::new(10);
        manager.insert("a");
        manager.close();
        assert!(manager.is_empty());
        assert!(!manager.insert("b"));
    }
}
