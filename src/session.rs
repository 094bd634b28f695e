//! Per-session context
//!
//! State that lives as long as one conversation: a TTL result cache and the
//! set of one-time reminders already shown. It is passed explicitly to the
//! turn loop and to tools instead of living in globals.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::Config;

/// Cache whose entries expire after a fixed TTL. Expired entries are
/// evicted on every access.
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        self.evict(&mut entries);
        entries.get(key).map(|(_, v)| v.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            self.evict(&mut entries);
            entries.insert(key.into(), (Instant::now(), value));
        }
    }

    /// Live entries
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                self.evict(&mut entries);
                entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, entries: &mut HashMap<String, (Instant, V)>) {
        let ttl = self.ttl;
        let before = entries.len();
        entries.retain(|_, (stored, _)| stored.elapsed() < ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} expired cache entries", evicted);
        }
    }
}

/// Context for one session
#[derive(Debug)]
pub struct SessionContext {
    /// Session ID
    pub id: String,
    /// User the session belongs to
    pub user: String,
    /// Application name used to namespace artifacts
    pub app: String,
    /// Tool result cache
    pub cache: TtlCache<String>,
    started: Mutex<HashSet<String>>,
}

impl SessionContext {
    pub fn new(id: &str, user: &str, app: &str, cache_ttl: Duration) -> Self {
        Self {
            id: id.to_string(),
            user: user.to_string(),
            app: app.to_string(),
            cache: TtlCache::new(cache_ttl),
            started: Mutex::new(HashSet::new()),
        }
    }

    /// Context for session `id` using configured user, app and TTL
    pub fn from_config(id: &str, config: &Config) -> Self {
        Self::new(
            id,
            &config.sessions.user,
            &config.artifacts.app_name,
            config.sessions.cache_ttl,
        )
    }

    /// Record that `key` has started. Returns true the first time only.
    pub fn mark_started(&self, key: &str) -> bool {
        self.started
            .lock()
            .map(|mut set| set.insert(key.to_string()))
            .unwrap_or(false)
    }

    pub fn is_started(&self, key: &str) -> bool {
        self.started
            .lock()
            .map(|set| set.contains(key))
            .unwrap_or(false)
    }
}
