//! Live sessions by id

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use super::session::{BunkerSession, SessionState};

/// Default idle horizon for [`SessionRegistry::evict_idle`], one day
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

/// Concurrent map of session id to session.
///
/// Cloning is cheap and every clone sees the same sessions. A missing id is
/// not an error; callers read it as "not logged in".
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<BunkerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `session` under its own id, replacing any previous entry.
    pub fn set(&self, session: Arc<BunkerSession>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<BunkerSession>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn delete(&self, id: &str) -> Option<Arc<BunkerSession>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Delete and close. Returns false if the id was unknown.
    pub async fn remove_and_close(&self, id: &str) -> bool {
        match self.delete(id) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Close and drop sessions idle for at least `max_idle`, plus any that
    /// are already closed. Returns how many were removed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let is_stale = |session: &Arc<BunkerSession>| {
            session.state() == SessionState::Closed || session.idle_for() >= max_idle
        };
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| is_stale(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in candidates {
            // Re-check under the shard lock; the session may have been used since.
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, session| is_stale(session)) {
                session.close().await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, remaining = self.sessions.len(), "Evicted idle bunker sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
