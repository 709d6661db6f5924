//! Bounded in-memory map of per-session traffic counters.
//!
//! Admission is first-come: once the configured limit is reached new session
//! keys are refused (no eviction), while updates to admitted keys always
//! succeed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::{debug, error};

pub type SessionCounters = BTreeMap<String, u64>;

#[derive(Debug)]
pub struct SessionCounterCache {
    limit: usize,
    sessions: Mutex<HashMap<String, SessionCounters>>,
}

impl SessionCounterCache {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `counters` under `key`. Returns false iff the cache is full
    /// and `key` is not already present.
    pub fn put(&self, key: &str, counters: SessionCounters) -> bool {
        let mut sessions = self.sessions.lock().expect("session cache lock poisoned");
        if !sessions.contains_key(key) && sessions.len() >= self.limit {
            error!(
                active = sessions.len(),
                limit = self.limit,
                "session counter map limit reached, refusing new session"
            );
            return false;
        }
        debug!(key, "storing session traffic counters");
        sessions.insert(key.to_string(), counters);
        true
    }

    pub fn get(&self, key: &str) -> Option<SessionCounters> {
        self.sessions
            .lock()
            .expect("session cache lock poisoned")
            .get(key)
            .cloned()
    }

    /// Removes `key`, returning how many entries were dropped (0 or 1).
    pub fn remove(&self, key: &str) -> usize {
        let mut sessions = self.sessions.lock().expect("session cache lock poisoned");
        usize::from(sessions.remove(key).is_some())
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(bytes: u64) -> SessionCounters {
        BTreeMap::from([("total-bytes".to_string(), bytes)])
    }

    #[test]
    fn put_get_remove_round_trip() {
        let cache = SessionCounterCache::new(4);
        assert!(cache.put("s1", counters(100)));
        assert_eq!(cache.get("s1"), Some(counters(100)));
        assert_eq!(cache.remove("s1"), 1);
        assert_eq!(cache.remove("s1"), 0);
        assert_eq!(cache.get("s1"), None);
    }

    #[test]
    fn limit_refuses_new_keys_without_eviction() {
        let cache = SessionCounterCache::new(2);
        assert!(cache.put("s1", counters(1)));
        assert!(cache.put("s2", counters(2)));
        assert!(!cache.put("s3", counters(3)));
        // existing keys still update at the limit
        assert!(cache.put("s1", counters(10)));
        assert_eq!(cache.get("s1"), Some(counters(10)));
        assert_eq!(cache.get("s3"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn removal_frees_capacity() {
        let cache = SessionCounterCache::new(1);
        assert!(cache.put("s1", counters(1)));
        assert!(!cache.put("s2", counters(2)));
        cache.remove("s1");
        assert!(cache.put("s2", counters(2)));
    }
}
